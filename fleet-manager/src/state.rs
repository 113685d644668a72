//! Per-printer state: the data record, and the handle that ties it to its
//! live transport and monitor task.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use fleet_core::{LineTransport, Telemetry};
use tokio_serial::SerialStream;

/// Everything about one printer that isn't the live transport itself.
#[derive(Debug, Default)]
pub struct PrinterRecord {
    pub port: String,
    pub baud: u32,
    pub queue: VecDeque<PathBuf>,
    pub telemetry: Telemetry,
    pub staged_local_path: Option<PathBuf>,
    pub staged_sd_name: Option<String>,
    pub model_removed: bool,
    pub job_error: bool,
}

impl PrinterRecord {
    pub fn new(port: String, baud: u32) -> Self {
        Self {
            port,
            baud,
            queue: VecDeque::new(),
            telemetry: Telemetry::default(),
            staged_local_path: None,
            staged_sd_name: None,
            model_removed: true,
            job_error: false,
        }
    }

    /// Remove the *last* occurrence of `path` from the queue, per the
    /// tie-break rule in the command API contract.
    pub fn remove_last_occurrence(&mut self, path: &PathBuf) -> bool {
        match self.queue.iter().rposition(|p| p == path) {
            Some(idx) => {
                self.queue.remove(idx);
                true
            }
            None => false,
        }
    }
}

/// A running monitor loop's control handle: signal it to stop, and a join
/// handle to wait on (best-effort, 5s timeout) before a transaction proceeds.
pub struct MonitorControl {
    pub stop: watch::Sender<bool>,
    pub handle: JoinHandle<()>,
}

/// Ties a printer's record, its serial transport, and its monitor control
/// together so the fleet can hand a single `Arc<PrinterHandle>` around.
///
/// Generic over the underlying stream type so tests can build a fleet on
/// top of an in-memory duplex stream instead of a real serial port; ordinary
/// callers use the `PrinterHandle` alias below, fixed to `SerialTransport`.
///
/// `record` and `transport` are themselves `Arc`-wrapped so the monitor task
/// can hold its own clone of each independently of whoever spawned it —
/// `transaction::resume` hands those clones straight to `monitor::spawn`.
pub struct GenericPrinterHandle<S> {
    pub record: Arc<StdMutex<PrinterRecord>>,
    pub transport: Arc<AsyncMutex<Option<LineTransport<S>>>>,
    pub monitor: StdMutex<Option<MonitorControl>>,
    /// The background Print-Job task spawned by the last `print_next`, if
    /// one is still running. Retained so `remove_printer` can abort it
    /// cleanly instead of leaving it detached.
    pub print_job: StdMutex<Option<JoinHandle<()>>>,
}

/// The production handle: a printer reached over a real serial port.
pub type PrinterHandle = GenericPrinterHandle<SerialStream>;

impl<S> GenericPrinterHandle<S> {
    pub fn new(record: PrinterRecord, transport: Option<LineTransport<S>>) -> Self {
        Self {
            record: Arc::new(StdMutex::new(record)),
            transport: Arc::new(AsyncMutex::new(transport)),
            monitor: StdMutex::new(None),
            print_job: StdMutex::new(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removes_last_occurrence_not_first() {
        let mut record = PrinterRecord::new("/dev/ttyX".into(), 115200);
        record.queue.push_back(PathBuf::from("a"));
        record.queue.push_back(PathBuf::from("b"));
        record.queue.push_back(PathBuf::from("a"));

        assert!(record.remove_last_occurrence(&PathBuf::from("a")));
        let remaining: Vec<_> = record.queue.iter().cloned().collect();
        assert_eq!(remaining, vec![PathBuf::from("a"), PathBuf::from("b")]);
    }

    #[test]
    fn removing_missing_path_reports_false() {
        let mut record = PrinterRecord::new("/dev/ttyX".into(), 115200);
        assert!(!record.remove_last_occurrence(&PathBuf::from("missing")));
    }
}
