//! Serial transport and line-protocol codec for talking to Marlin/Prusa-family
//! 3D printers. This crate owns no fleet policy — that lives in `fleet-manager`.

pub mod codec;
pub mod error;
pub mod serial;
pub mod telemetry;

pub use codec::{frame_checksummed, parse_line, ParsedLine};
pub use error::Error;
pub use serial::{LineTransport, SerialTransport};
pub use telemetry::{format_upload_duration, Status, Telemetry, TelemetrySnapshot};
