//! Fleet policy: per-printer state, the monitor loop, the transaction engine
//! that serializes exclusive port access, config persistence, and the public
//! `FleetManager` façade. The wire-level concerns (framing, parsing, the raw
//! transport) live in `fleet-core`; this crate is all policy on top of it.

pub mod config;
pub mod error;
pub mod fleet;
pub mod monitor;
pub mod sdname;
pub mod state;
pub mod transaction;

pub use config::{PrinterSnapshot, Snapshot, DEFAULT_SNAPSHOT_PATH};
pub use error::{FleetError, FleetResult};
pub use fleet::FleetManager;
pub use state::{GenericPrinterHandle, MonitorControl, PrinterHandle, PrinterRecord};
