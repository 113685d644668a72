//! The transaction engine: every operation here needs exclusive access to a
//! printer's port, so each one quiesces the monitor, does its work, and
//! restarts the monitor on the way out — success or failure.
//!
//! Most operations here are generic over the transport's stream type so the
//! integration tests can drive them against an in-memory duplex stream
//! instead of a real serial port; `connect`/`reconnect` are the exception,
//! since opening a device is inherently specific to `SerialTransport`.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite};

use fleet_core::{codec, SerialTransport, Status};

use crate::error::{FleetError, FleetResult};
use crate::sdname;
use crate::state::{GenericPrinterHandle, PrinterHandle};

/// How long a quiesce waits for the monitor task to join before proceeding anyway.
pub const MONITOR_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
/// How long to let the firmware settle after the monitor stops issuing polls.
pub const FIRMWARE_SETTLE_DELAY: Duration = Duration::from_secs(10);

/// Upload throughput fudge factor: real transfer rate is well under the
/// nominal baud rate once framing, acks, and firmware processing are counted.
const UPLOAD_EFFICIENCY: f64 = 0.35;

/// Stop the monitor (if any), join it with a timeout, and sleep out the
/// firmware-settle delay. Pair with [`resume`] once the transaction is done.
pub async fn quiesce<S>(handle: &Arc<GenericPrinterHandle<S>>, name: &str) {
    let control = handle.monitor.lock().unwrap().take();
    if let Some(control) = control {
        let _ = control.stop.send(true);
        match tokio::time::timeout(MONITOR_JOIN_TIMEOUT, control.handle).await {
            Ok(_) => tracing::debug!("monitor for {name} joined cleanly"),
            Err(_) => tracing::warn!(
                "monitor for {name} did not join within {MONITOR_JOIN_TIMEOUT:?}, proceeding anyway"
            ),
        }
        tokio::time::sleep(FIRMWARE_SETTLE_DELAY).await;
    }
}

/// Restart the monitor loop, unless the transport has since been removed.
pub async fn resume<S>(handle: &Arc<GenericPrinterHandle<S>>, name: Arc<str>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    if handle.transport.lock().await.is_none() {
        return;
    }
    let control = crate::monitor::spawn(name, handle.transport.clone(), handle.record.clone());
    *handle.monitor.lock().unwrap() = Some(control);
}

/// Open the transport fresh and reset telemetry/queue, as for a brand-new printer.
pub async fn connect(
    handle: &Arc<PrinterHandle>,
    name: Arc<str>,
    port: &str,
    baud: u32,
) -> FleetResult<()> {
    let transport = SerialTransport::open(port, baud).await?;
    *handle.transport.lock().await = Some(transport);
    {
        let mut rec = handle.record.lock().unwrap();
        rec.port = port.to_string();
        rec.baud = baud;
        rec.telemetry = fleet_core::Telemetry::default();
        rec.telemetry.status = Status::Idle;
        rec.model_removed = true;
        rec.job_error = false;
        rec.queue.clear();
    }
    resume(handle, name).await;
    Ok(())
}

/// Reopen the transport for a printer that was `Disconnected`, preserving
/// queue and staged-file state so an interrupted job can be resumed.
pub async fn reconnect(handle: &Arc<PrinterHandle>, name: Arc<str>) -> FleetResult<()> {
    let (port, baud) = {
        let rec = handle.record.lock().unwrap();
        (rec.port.clone(), rec.baud)
    };
    let transport = SerialTransport::open(&port, baud).await?;
    *handle.transport.lock().await = Some(transport);
    handle.record.lock().unwrap().telemetry.status = Status::Idle;
    resume(handle, name).await;
    Ok(())
}

/// Quiesce the monitor and close the transport. The caller (the fleet façade)
/// is responsible for dropping the handle from its map and persisting.
pub async fn disconnect<S>(handle: &Arc<GenericPrinterHandle<S>>, name: &str)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    quiesce(handle, name).await;
    if let Some(transport) = handle.transport.lock().await.take() {
        transport.close().await;
    }
}

/// Debug pass-through: send one raw line and return whatever came back.
pub async fn send_gcode<S>(
    handle: &Arc<GenericPrinterHandle<S>>,
    name: Arc<str>,
    gcode: &str,
) -> FleetResult<Vec<String>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    quiesce(handle, &name).await;
    let result = {
        let mut guard = handle.transport.lock().await;
        match guard.as_mut() {
            Some(port) => Ok(port.send(gcode, true).await),
            None => Err(FleetError::value("printer is not connected")),
        }
    };
    resume(handle, name).await;
    result
}

fn extract_sd_filenames(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .filter(|l| !l.eq_ignore_ascii_case("Begin file list") && !l.eq_ignore_ascii_case("End file list"))
        .cloned()
        .collect()
}

/// `ceil(bits / baud) / efficiency`, matching the original estimator.
fn estimate_upload_seconds(file_bytes: u64, baud: u32) -> f64 {
    let transfer_seconds = (file_bytes as f64 * 8.0 / baud as f64).ceil();
    transfer_seconds / UPLOAD_EFFICIENCY
}

/// Upload `local_path` to the printer's SD card under a freshly allocated
/// 8.3 name, line by line, with a checksum on each frame.
pub async fn sd_upload<S>(
    handle: &Arc<GenericPrinterHandle<S>>,
    name: Arc<str>,
    local_path: &Path,
) -> FleetResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let file_bytes = tokio::fs::metadata(local_path)
        .await
        .map_err(|e| FleetError::upload(format!("cannot stat {local_path:?}: {e}")))?
        .len();
    let contents = tokio::fs::read_to_string(local_path)
        .await
        .map_err(|e| FleetError::upload(format!("cannot read {local_path:?}: {e}")))?;

    quiesce(handle, &name).await;
    let result = run_sd_upload(handle, local_path, file_bytes, &contents).await;
    match &result {
        Ok(sd_name) => {
            let mut rec = handle.record.lock().unwrap();
            rec.staged_local_path = Some(local_path.to_path_buf());
            rec.staged_sd_name = Some(sd_name.clone());
            rec.job_error = false;
        }
        Err(_) => handle.record.lock().unwrap().job_error = true,
    }
    resume(handle, name).await;
    result.map(|_| ())
}

/// Runs the upload and returns the SD name it was written under. The caller
/// is responsible for stashing `staged_sd_name`/`staged_local_path` — this
/// function must not do so itself, since the name isn't actually resident on
/// the SD card until `M29` closes it successfully.
async fn run_sd_upload<S>(
    handle: &Arc<GenericPrinterHandle<S>>,
    local_path: &Path,
    file_bytes: u64,
    contents: &str,
) -> FleetResult<String>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let baud = handle.record.lock().unwrap().baud;

    let mut guard = handle.transport.lock().await;
    let port = guard
        .as_mut()
        .ok_or_else(|| FleetError::value("printer is not connected"))?;

    let listing = port.send("M20", false).await;
    let existing = extract_sd_filenames(&listing);
    let sd_name = sdname::allocate(local_path, &existing)?;

    handle.record.lock().unwrap().telemetry.status = Status::UploadingToSd;

    let estimate_seconds = estimate_upload_seconds(file_bytes, baud);
    let start = Instant::now();

    port.send(&format!("M110 N0 {sd_name}"), false).await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    let open_response = port.send(&format!("M28 {sd_name}"), false).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    if open_response.iter().any(|l| l.contains("open failed")) {
        return Err(FleetError::upload(format!("SD card refused to open {sd_name}")));
    }

    let mut line_number = 1u32;
    for raw_line in contents.lines() {
        let Some(framed) = codec::frame_checksummed(line_number, raw_line) else {
            continue;
        };
        let response = port.send(&framed, true).await;
        if response.iter().any(|l| l.contains("Error")) {
            return Err(FleetError::upload(format!(
                "printer reported an error on line {line_number}"
            )));
        }
        line_number += 1;

        let elapsed = start.elapsed().as_secs_f64();
        let remaining = (estimate_seconds - elapsed).max(0.0);
        let mut rec = handle.record.lock().unwrap();
        rec.telemetry.sd_upload_elapsed = fleet_core::format_upload_duration(elapsed);
        rec.telemetry.sd_upload_remaining = fleet_core::format_upload_duration(remaining);
    }

    port.send(&format!("M29 {sd_name}"), false).await;
    Ok(sd_name)
}

/// Kick off printing the currently staged SD file.
pub async fn print_from_sd<S>(handle: &Arc<GenericPrinterHandle<S>>, name: Arc<str>) -> FleetResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    quiesce(handle, &name).await;

    let sd_name = handle.record.lock().unwrap().staged_sd_name.clone();
    let result = match sd_name {
        None => Err(FleetError::value("no staged SD file to print")),
        Some(sd_name) => {
            let mut guard = handle.transport.lock().await;
            match guard.as_mut() {
                Some(port) => {
                    port.send(&format!("M32 {sd_name}"), false).await;
                    Ok(())
                }
                None => Err(FleetError::value("printer is not connected")),
            }
        }
    };

    if result.is_ok() {
        let mut rec = handle.record.lock().unwrap();
        rec.telemetry.status = Status::SdPrinting;
        rec.model_removed = false;
    }

    resume(handle, name).await;
    result
}

/// Break out of the current print (if any), then run the unconditional
/// shutdown sequence: cool down, fan off, home X/Y, disable motors.
pub async fn cancel<S>(handle: &Arc<GenericPrinterHandle<S>>, name: Arc<str>) -> FleetResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    quiesce(handle, &name).await;

    {
        let mut guard = handle.transport.lock().await;
        if let Some(port) = guard.as_mut() {
            let was_printing = handle.record.lock().unwrap().telemetry.status == Status::SdPrinting;
            if was_printing {
                port.send("M108", false).await;
                port.send("M524", false).await;
                port.send("M603", false).await;
            }
            for cmd in [
                "M29", "M104 S0", "M140 S0", "M107", "G91", "G1 Z10 F300", "G90", "G28 X Y", "M84",
            ] {
                port.send(cmd, false).await;
            }
        }
    }

    handle.record.lock().unwrap().job_error = true;
    resume(handle, name).await;
    Ok(())
}

/// Delete the printer's currently staged SD file, if there is one.
pub async fn delete_sd_file<S>(handle: &Arc<GenericPrinterHandle<S>>, name: Arc<str>) -> FleetResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let sd_name = handle.record.lock().unwrap().staged_sd_name.clone();
    let Some(sd_name) = sd_name else {
        return Ok(());
    };

    quiesce(handle, &name).await;
    {
        let mut guard = handle.transport.lock().await;
        if let Some(port) = guard.as_mut() {
            port.send(&format!("M30 {sd_name}"), false).await;
        }
    }
    resume(handle, name).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_scales_inversely_with_baud() {
        let fast = estimate_upload_seconds(115_200, 250_000);
        let slow = estimate_upload_seconds(115_200, 115_200);
        assert!(fast < slow);
    }

    #[test]
    fn estimate_applies_efficiency_fudge_factor() {
        // 1000 bytes at 8000 baud transfers in exactly 1s at the wire; the
        // efficiency factor should inflate that estimate.
        let seconds = estimate_upload_seconds(1000, 8000);
        assert!(seconds > 1.0);
    }

    #[test]
    fn file_list_sentinels_are_stripped() {
        let lines = vec![
            "Begin file list".to_string(),
            "PART00_0.GCO 12345".to_string(),
            "End file list".to_string(),
        ];
        let files = extract_sd_filenames(&lines);
        assert_eq!(files, vec!["PART00_0.GCO 12345".to_string()]);
    }

    #[test]
    fn join_timeout_shorter_than_settle_delay() {
        assert!(MONITOR_JOIN_TIMEOUT < FIRMWARE_SETTLE_DELAY);
    }
}
