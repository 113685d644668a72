//! Best-effort config snapshot: a single JSON file capturing enough state to
//! resume monitoring after a process restart. Not a log, not write-ahead —
//! just overwritten in full on every mutating operation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use fleet_core::Status;

use crate::state::PrinterRecord;

pub const DEFAULT_SNAPSHOT_PATH: &str = "fleet_config.json";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PrinterSnapshot {
    pub port: String,
    #[serde(default = "default_baud")]
    pub baudrate: u32,
    #[serde(default)]
    pub queue: Vec<PathBuf>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub current_byte: u64,
    #[serde(default)]
    pub total_byte: u64,
    #[serde(default)]
    pub sd_upload_time: Option<String>,
    #[serde(default)]
    pub sd_upload_time_remaining: Option<String>,
    #[serde(default)]
    pub time_seconds: u64,
    #[serde(default)]
    pub model_removed: bool,
    #[serde(default)]
    pub current_file: Option<PathBuf>,
    #[serde(default)]
    pub current_sd_file: Option<String>,
    #[serde(default)]
    pub job_status_error: bool,
}

fn default_baud() -> u32 {
    115200
}

pub type Snapshot = HashMap<String, PrinterSnapshot>;

impl PrinterSnapshot {
    pub fn from_record(record: &PrinterRecord) -> Self {
        Self {
            port: record.port.clone(),
            baudrate: record.baud,
            queue: record.queue.iter().cloned().collect(),
            status: record.telemetry.status.as_str().to_string(),
            current_byte: record.telemetry.current_byte,
            total_byte: record.telemetry.total_byte,
            sd_upload_time: Some(record.telemetry.sd_upload_elapsed.clone()),
            sd_upload_time_remaining: Some(record.telemetry.sd_upload_remaining.clone()),
            time_seconds: record.telemetry.elapsed_seconds,
            model_removed: record.model_removed,
            current_file: record.staged_local_path.clone(),
            current_sd_file: record.staged_sd_name.clone(),
            job_status_error: record.job_error,
        }
    }

    /// Reconstruct enough of a `PrinterRecord` to restart monitoring. Any
    /// transient telemetry that can't survive a restart (temperatures, for
    /// instance) is left at its default.
    pub fn into_record(self) -> PrinterRecord {
        let mut record = PrinterRecord::new(self.port, self.baudrate);
        record.queue = self.queue.into_iter().collect();
        record.telemetry.current_byte = self.current_byte;
        record.telemetry.total_byte = self.total_byte;
        record.telemetry.elapsed_seconds = self.time_seconds;
        record.telemetry.status = if self.status == Status::Disconnected.as_str() {
            Status::Disconnected
        } else {
            Status::Unknown
        };
        record.model_removed = self.model_removed;
        record.staged_local_path = self.current_file;
        record.staged_sd_name = self.current_sd_file;
        record.job_error = self.job_status_error;
        record
    }
}

/// Load the snapshot at `path`. Malformed or missing files are logged and
/// treated as "start empty" — the fleet never fails to boot over a bad
/// snapshot.
pub fn load(path: &Path) -> Snapshot {
    match std::fs::read_to_string(path) {
        Ok(data) => match serde_json::from_str(&data) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!("malformed config snapshot at {path:?}: {e}, starting empty");
                Snapshot::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Snapshot::default(),
        Err(e) => {
            tracing::warn!("could not read config snapshot at {path:?}: {e}, starting empty");
            Snapshot::default()
        }
    }
}

/// Overwrite the snapshot file in full. Best-effort: failures are logged, not
/// propagated, matching the "best-effort overwrite" persistence contract.
pub fn save(path: &Path, snapshot: &Snapshot) {
    match serde_json::to_string_pretty(snapshot) {
        Ok(data) => {
            if let Err(e) = std::fs::write(path, data) {
                tracing::error!("failed to persist config snapshot to {path:?}: {e}");
            }
        }
        Err(e) => tracing::error!("failed to serialize config snapshot: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");

        let mut record = PrinterRecord::new("/dev/ttyUSB0".into(), 250000);
        record.queue.push_back(PathBuf::from("/tmp/a.gcode"));
        record.model_removed = false;
        record.staged_sd_name = Some("ACODE_0.GCO".to_string());

        let mut snapshot = Snapshot::default();
        snapshot.insert("printer-1".to_string(), PrinterSnapshot::from_record(&record));
        save(&path, &snapshot);

        let loaded = load(&path);
        let restored = loaded.get("printer-1").unwrap();
        assert_eq!(restored.port, "/dev/ttyUSB0");
        assert_eq!(restored.baudrate, 250000);
        assert_eq!(restored.queue, vec![PathBuf::from("/tmp/a.gcode")]);
        assert_eq!(restored.current_sd_file.as_deref(), Some("ACODE_0.GCO"));
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does_not_exist.json");
        assert!(load(&path).is_empty());
    }

    #[test]
    fn malformed_file_loads_empty_instead_of_failing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "not json at all").unwrap();
        assert!(load(&path).is_empty());
    }

    #[test]
    fn tolerates_missing_keys_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sparse.json");
        std::fs::write(&path, r#"{"printer-1": {"port": "/dev/ttyX"}}"#).unwrap();
        let loaded = load(&path);
        let restored = loaded.get("printer-1").unwrap();
        assert_eq!(restored.baudrate, 115200);
        assert!(!restored.model_removed);
    }
}
