//! One cooperative monitor task per connected printer: drains whatever the
//! firmware already sent, polls for status when idle, and watches for a
//! liveness timeout.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use fleet_core::{codec, LineTransport, Status};

use crate::state::{MonitorControl, PrinterRecord};

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(10);

/// Start a monitor task for `name`, returning its control handle. The task
/// owns no `Arc<PrinterHandle>` directly so that a transaction engine holding
/// its own clone can freely lock `transport`/`record` without the monitor in
/// its way once it's been told to stop.
pub fn spawn<S>(
    name: Arc<str>,
    transport: Arc<AsyncMutex<Option<LineTransport<S>>>>,
    record: Arc<StdMutex<PrinterRecord>>,
) -> MonitorControl
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(run(name, transport, record, stop_rx));
    MonitorControl {
        stop: stop_tx,
        handle,
    }
}

async fn run<S>(
    name: Arc<str>,
    transport: Arc<AsyncMutex<Option<LineTransport<S>>>>,
    record: Arc<StdMutex<PrinterRecord>>,
    mut stop_rx: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut last_idle_seen = Instant::now();

    loop {
        if *stop_rx.borrow() {
            tracing::debug!("monitor for {name} told to stop");
            break;
        }

        {
            let mut guard = transport.lock().await;
            let Some(port) = guard.as_mut() else {
                tracing::debug!("monitor for {name} found no transport, exiting");
                break;
            };

            while let Some(line) = port.try_read_line().await {
                apply_line(&record, &line, &mut last_idle_seen);
            }

            for cmd in ["M27", "M105", "M31"] {
                let _ = port.send(cmd, false).await;
            }

            if !port.connected() {
                let mut rec = record.lock().unwrap();
                rec.telemetry.status = Status::Disconnected;
                tracing::warn!("monitor for {name} lost the port");
                break;
            }
        }

        if last_idle_seen.elapsed() > LIVENESS_TIMEOUT {
            let mut rec = record.lock().unwrap();
            if rec.telemetry.status == Status::Idle {
                rec.telemetry.status = Status::Disconnected;
                drop(rec);
                tracing::warn!("monitor for {name} saw no idle report for 10s, marking disconnected");
                break;
            }
        }

        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }
}

fn apply_line(record: &Arc<StdMutex<PrinterRecord>>, line: &str, last_idle_seen: &mut Instant) {
    let parsed = codec::parse_line(line);
    if parsed.is_empty() {
        return;
    }

    let mut rec = record.lock().unwrap();
    let telemetry = &mut rec.telemetry;

    if let Some(hotend) = parsed.hotend_temp {
        telemetry.hotend_temp = hotend;
    }
    if let Some(bed) = parsed.bed_temp {
        telemetry.bed_temp = bed;
    }
    if let Some(seconds) = parsed.print_time_seconds {
        if telemetry.status == Status::SdPrinting {
            telemetry.elapsed_seconds = seconds;
        }
    }
    if let Some(percent) = parsed.percent_done_prusa {
        telemetry.percent_prusa = Some(percent);
    }
    if let Some(mins) = parsed.minutes_remaining_prusa {
        telemetry.minutes_remaining_prusa = Some(mins);
    }
    if let (Some(cur), Some(tot)) = (parsed.current_byte, parsed.total_byte) {
        telemetry.current_byte = cur;
        telemetry.total_byte = tot;
        telemetry.status = Status::SdPrinting;
    }
    if parsed.idle {
        telemetry.status = Status::Idle;
        *last_idle_seen = Instant::now();
    }

    telemetry.recompute_progress();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sd_progress_line_sets_status_sd_printing() {
        let record = Arc::new(StdMutex::new(PrinterRecord::new("/dev/ttyX".into(), 115200)));
        let mut last_idle = Instant::now();
        apply_line(&record, "SD printing byte 10/100", &mut last_idle);
        let rec = record.lock().unwrap();
        assert_eq!(rec.telemetry.status, Status::SdPrinting);
        assert_eq!(rec.telemetry.current_byte, 10);
    }

    #[test]
    fn idle_line_resets_status_and_timestamp() {
        let record = Arc::new(StdMutex::new(PrinterRecord::new("/dev/ttyX".into(), 115200)));
        let mut last_idle = Instant::now() - Duration::from_secs(100);
        apply_line(&record, "Not SD printing", &mut last_idle);
        assert!(last_idle.elapsed() < Duration::from_secs(1));
        let rec = record.lock().unwrap();
        assert_eq!(rec.telemetry.status, Status::Idle);
    }

    #[test]
    fn unrelated_line_is_a_no_op() {
        let record = Arc::new(StdMutex::new(PrinterRecord::new("/dev/ttyX".into(), 115200)));
        let mut last_idle = Instant::now();
        apply_line(&record, "echo:busy: processing", &mut last_idle);
        let rec = record.lock().unwrap();
        assert_eq!(rec.telemetry.hotend_temp, 0.0);
    }
}
