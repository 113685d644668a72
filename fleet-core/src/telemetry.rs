//! Telemetry types shared by the monitor loop and the fleet façade.

use serde::{Deserialize, Serialize};

/// Coarse printer state as reported by the firmware, mirrored into the
/// record's `status` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Status {
    #[default]
    Disconnected,
    Idle,
    UploadingToSd,
    SdPrinting,
    Unknown,
}

impl Status {
    /// The human-facing string surfaced through the query API, matching the
    /// firmware's own vocabulary where one exists (`"Not SD printing"` for idle).
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Disconnected => "Disconnected",
            Status::Idle => "Not SD printing",
            Status::UploadingToSd => "Uploading to SD card",
            Status::SdPrinting => "SD printing",
            Status::Unknown => "Unknown",
        }
    }
}

/// Per-printer transient telemetry. All mutation is expected to happen
/// through a single lock held by the owning `PrinterRecord`.
#[derive(Debug, Clone)]
pub struct Telemetry {
    pub status: Status,
    pub hotend_temp: f64,
    pub bed_temp: f64,
    pub current_byte: u64,
    pub total_byte: u64,
    pub elapsed_seconds: u64,
    pub percent: u8,
    pub percent_prusa: Option<u8>,
    pub minutes_remaining_prusa: Option<i64>,
    pub time_remaining: String,
    pub sd_upload_elapsed: String,
    pub sd_upload_remaining: String,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self {
            status: Status::default(),
            hotend_temp: 0.0,
            bed_temp: 0.0,
            current_byte: 0,
            total_byte: 0,
            elapsed_seconds: 0,
            percent: 0,
            percent_prusa: None,
            minutes_remaining_prusa: None,
            time_remaining: "N/A".to_string(),
            sd_upload_elapsed: "N/A".to_string(),
            sd_upload_remaining: "N/A".to_string(),
        }
    }
}

impl Telemetry {
    /// Re-derive `percent` and `time_remaining` from the current byte counters
    /// and any Prusa-reported percent/remaining-minutes. Mirrors the
    /// progress-estimation rules in the line protocol spec: Prusa reports win
    /// when present, byte counters are the fallback, and completion clamps
    /// `current_byte` up to `total_byte`.
    pub fn recompute_progress(&mut self) {
        if self.total_byte == 0 || self.elapsed_seconds == 0 {
            self.time_remaining = "0s".to_string();
            self.percent = 0;
            return;
        }

        if self.current_byte >= self.total_byte || self.status == Status::Idle {
            self.current_byte = self.total_byte;
            self.percent = 100;
            self.time_remaining = "Printing Completed".to_string();
            return;
        }

        let percent_completed = match self.percent_prusa {
            Some(p) => p as f64,
            None => (self.current_byte as f64 / self.total_byte as f64) * 100.0,
        };
        self.percent = percent_completed.min(100.0) as u8;

        self.time_remaining = match self.minutes_remaining_prusa {
            Some(mins) => {
                let remaining_seconds = (mins * 60).max(0);
                format_remaining(remaining_seconds as f64, self.status)
            }
            None => "Calculating...".to_string(),
        };
    }
}

fn format_remaining(seconds: f64, status: Status) -> String {
    if seconds > 3600.0 {
        format!(
            "{}h {}m",
            (seconds as u64) / 3600,
            (seconds as u64) % 3600 / 60
        )
    } else if seconds > 60.0 {
        format!("{}m", (seconds as u64) / 60)
    } else if seconds > 0.0 && status == Status::SdPrinting {
        format!("{}s", seconds as u64)
    } else {
        "Printing Completed".to_string()
    }
}

/// Format an elapsed/remaining duration the way the SD-upload progress does:
/// `Xm Ys` past a minute, otherwise `Ys`. Never negative.
pub fn format_upload_duration(seconds: f64) -> String {
    let seconds = seconds.max(0.0);
    if seconds > 60.0 {
        format!("{}m {}s", (seconds as u64) / 60, (seconds as u64) % 60)
    } else {
        format!("{}s", seconds as u64)
    }
}

/// A flattened, query-API-facing snapshot. Missing data is reported as the
/// literal string `"N/A"`, matching the external contract.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySnapshot {
    pub status: String,
    pub sd_upload_time: String,
    pub sd_upload_time_remaining: String,
    pub print_time: String,
    pub estimated_time_remaining: String,
    pub current_byte: u64,
    pub total_byte: u64,
    pub print_progress: String,
    pub hotend_temp: String,
    pub bed_temp: String,
}

impl From<&Telemetry> for TelemetrySnapshot {
    fn from(t: &Telemetry) -> Self {
        Self {
            status: t.status.as_str().to_string(),
            sd_upload_time: t.sd_upload_elapsed.clone(),
            sd_upload_time_remaining: t.sd_upload_remaining.clone(),
            print_time: if t.elapsed_seconds == 0 {
                "N/A".to_string()
            } else {
                t.elapsed_seconds.to_string()
            },
            estimated_time_remaining: t.time_remaining.clone(),
            current_byte: t.current_byte,
            total_byte: t.total_byte,
            print_progress: format!("{}%", t.percent),
            hotend_temp: t.hotend_temp.to_string(),
            bed_temp: t.bed_temp.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_text_matches_firmware_vocabulary() {
        assert_eq!(Status::Idle.as_str(), "Not SD printing");
        assert_eq!(Status::UploadingToSd.as_str(), "Uploading to SD card");
        assert_eq!(Status::SdPrinting.as_str(), "SD printing");
    }

    #[test]
    fn percent_is_zero_with_no_data() {
        let mut t = Telemetry::default();
        t.recompute_progress();
        assert_eq!(t.percent, 0);
    }

    #[test]
    fn prusa_percent_overrides_byte_derived() {
        let mut t = Telemetry {
            status: Status::SdPrinting,
            total_byte: 1000,
            current_byte: 100,
            elapsed_seconds: 30,
            percent_prusa: Some(77),
            ..Telemetry::default()
        };
        t.recompute_progress();
        assert_eq!(t.percent, 77);
    }

    #[test]
    fn completion_clamps_current_byte_and_reports_completed() {
        let mut t = Telemetry {
            status: Status::Idle,
            total_byte: 1000,
            current_byte: 1000,
            elapsed_seconds: 30,
            ..Telemetry::default()
        };
        t.recompute_progress();
        assert_eq!(t.current_byte, t.total_byte);
        assert_eq!(t.percent, 100);
        assert_eq!(t.time_remaining, "Printing Completed");
    }

    #[test]
    fn upload_duration_formats_minutes_past_sixty_seconds() {
        assert_eq!(format_upload_duration(5.0), "5s");
        assert_eq!(format_upload_duration(65.0), "1m 5s");
        assert_eq!(format_upload_duration(-3.0), "0s");
    }
}
