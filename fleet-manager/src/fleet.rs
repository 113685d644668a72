//! The public façade: an explicit service object owning the whole printer
//! fleet. No global state — callers hold an `Arc<FleetManager>` and share it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use fleet_core::{Status, TelemetrySnapshot};

use crate::config::{self, PrinterSnapshot, Snapshot};
use crate::error::{FleetError, FleetResult};
use crate::state::{PrinterHandle, PrinterRecord};
use crate::transaction;

fn respond(raise_on_error: bool, result: FleetResult<()>) -> FleetResult<()> {
    if let Err(ref e) = result {
        tracing::warn!("{e}");
    }
    if raise_on_error {
        result
    } else {
        Ok(())
    }
}

/// Owns every connected printer and the snapshot that persists across restarts.
pub struct FleetManager {
    printers: StdMutex<HashMap<String, Arc<PrinterHandle>>>,
    config_path: PathBuf,
}

impl FleetManager {
    /// Load the snapshot at `config_path`, reconstruct printer records, start
    /// a monitor for each, and attempt to reconnect any that were
    /// `Disconnected` when the process last exited.
    pub async fn load(config_path: PathBuf) -> Arc<Self> {
        let snapshot = config::load(&config_path);
        let fleet = Arc::new(Self {
            printers: StdMutex::new(HashMap::new()),
            config_path,
        });

        for (name, printer_snapshot) in snapshot {
            fleet.restore_one(name, printer_snapshot).await;
        }

        fleet
    }

    async fn restore_one(self: &Arc<Self>, name: String, snapshot: PrinterSnapshot) {
        let was_disconnected = snapshot.status == Status::Disconnected.as_str();
        let port = snapshot.port.clone();
        let record = snapshot.into_record();
        let handle = Arc::new(PrinterHandle::new(record, None));
        self.printers
            .lock()
            .unwrap()
            .insert(name.clone(), handle.clone());

        let name_arc: Arc<str> = Arc::from(name.as_str());
        if was_disconnected {
            match transaction::reconnect(&handle, name_arc).await {
                Ok(()) => tracing::info!("reconnected {name} on {port}"),
                Err(e) => tracing::warn!("failed to reconnect {name} on {port}: {e}"),
            }
        } else {
            tracing::warn!("{name} was not cleanly disconnected last run; marking disconnected");
            handle.record.lock().unwrap().telemetry.status = Status::Disconnected;
        }
    }

    fn get_handle(&self, name: &str) -> FleetResult<Arc<PrinterHandle>> {
        self.printers
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| FleetError::value(format!("unknown printer {name}")))
    }

    fn persist(&self) {
        let printers = self.printers.lock().unwrap();
        let mut snapshot = Snapshot::new();
        for (name, handle) in printers.iter() {
            let rec = handle.record.lock().unwrap();
            snapshot.insert(name.clone(), PrinterSnapshot::from_record(&rec));
        }
        drop(printers);
        config::save(&self.config_path, &snapshot);
    }

    /// OS-visible serial ports, excluding ones the driver can't describe.
    pub fn list_serial_ports() -> FleetResult<Vec<(String, String)>> {
        let ports = tokio_serial::available_ports()
            .map_err(|e| FleetError::value(format!("could not enumerate serial ports: {e}")))?;
        Ok(ports
            .into_iter()
            .map(|p| (p.port_name, describe_port_type(&p.port_type)))
            .filter(|(_, description)| description != "n/a")
            .collect())
    }

    pub async fn connect_printer(
        &self,
        name: &str,
        port: &str,
        baud: u32,
        raise_on_error: bool,
    ) -> FleetResult<()> {
        let result = self.connect_printer_inner(name, port, baud).await;
        respond(raise_on_error, result)
    }

    async fn connect_printer_inner(&self, name: &str, port: &str, baud: u32) -> FleetResult<()> {
        {
            let printers = self.printers.lock().unwrap();
            if printers.contains_key(name) {
                return Err(FleetError::value(format!("printer {name} already exists")));
            }
            if printers.values().any(|h| h.record.lock().unwrap().port == port) {
                return Err(FleetError::value(format!("port {port} is already in use")));
            }
        }

        let record = PrinterRecord::new(port.to_string(), baud);
        let handle = Arc::new(PrinterHandle::new(record, None));
        transaction::connect(&handle, Arc::from(name), port, baud).await?;
        self.printers.lock().unwrap().insert(name.to_string(), handle);
        self.persist();
        Ok(())
    }

    pub async fn remove_printer(&self, name: &str, raise_on_error: bool) -> FleetResult<()> {
        let result = self.remove_printer_inner(name).await;
        respond(raise_on_error, result)
    }

    async fn remove_printer_inner(&self, name: &str) -> FleetResult<()> {
        let handle = self.get_handle(name)?;
        if let Some(job) = handle.print_job.lock().unwrap().take() {
            job.abort();
        }
        transaction::disconnect(&handle, name).await;
        self.printers.lock().unwrap().remove(name);
        self.persist();
        Ok(())
    }

    pub async fn reconnect_printer(&self, name: &str, raise_on_error: bool) -> FleetResult<()> {
        let result = self.reconnect_printer_inner(name).await;
        respond(raise_on_error, result)
    }

    async fn reconnect_printer_inner(&self, name: &str) -> FleetResult<()> {
        let handle = self.get_handle(name)?;
        let status = handle.record.lock().unwrap().telemetry.status;
        if status != Status::Disconnected {
            return Err(FleetError::value(format!("{name} is not disconnected")));
        }
        transaction::reconnect(&handle, Arc::from(name)).await?;
        self.persist();
        Ok(())
    }

    /// Debug pass-through: send one raw line, bypassing the queue entirely.
    pub async fn send_gcode(
        &self,
        name: &str,
        gcode: &str,
        raise_on_error: bool,
    ) -> FleetResult<Vec<String>> {
        let handle = match self.get_handle(name) {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!("{e}");
                return if raise_on_error { Err(e) } else { Ok(Vec::new()) };
            }
        };
        match transaction::send_gcode(&handle, Arc::from(name), gcode).await {
            Ok(lines) => Ok(lines),
            Err(e) => {
                tracing::warn!("{e}");
                if raise_on_error {
                    Err(e)
                } else {
                    Ok(Vec::new())
                }
            }
        }
    }

    pub async fn add_to_queue(&self, name: &str, path: PathBuf, raise_on_error: bool) -> FleetResult<()> {
        let result = self.add_to_queue_inner(name, path);
        respond(raise_on_error, result)
    }

    fn add_to_queue_inner(&self, name: &str, path: PathBuf) -> FleetResult<()> {
        if !path.exists() {
            return Err(FleetError::value(format!("{path:?} does not exist")));
        }
        let handle = self.get_handle(name)?;
        handle.record.lock().unwrap().queue.push_back(path);
        self.persist();
        Ok(())
    }

    pub async fn remove_from_queue(
        &self,
        name: &str,
        path: &Path,
        raise_on_error: bool,
    ) -> FleetResult<()> {
        let result = self.remove_from_queue_inner(name, path);
        respond(raise_on_error, result)
    }

    fn remove_from_queue_inner(&self, name: &str, path: &Path) -> FleetResult<()> {
        let handle = self.get_handle(name)?;
        let mut rec = handle.record.lock().unwrap();
        if rec.staged_local_path.as_deref() == Some(path) && rec.telemetry.status == Status::SdPrinting {
            return Err(FleetError::value("cannot remove the file currently printing"));
        }
        if !rec.remove_last_occurrence(&path.to_path_buf()) {
            return Err(FleetError::value(format!("{path:?} is not in the queue")));
        }
        drop(rec);
        self.persist();
        Ok(())
    }

    pub async fn print_gcode(self: &Arc<Self>, name: &str, path: PathBuf, raise_on_error: bool) -> FleetResult<()> {
        let result = self.print_gcode_inner(name, path).await;
        respond(raise_on_error, result)
    }

    async fn print_gcode_inner(self: &Arc<Self>, name: &str, path: PathBuf) -> FleetResult<()> {
        self.add_to_queue_inner(name, path)?;
        self.print_next_inner(name).await
    }

    pub async fn print_next(self: &Arc<Self>, name: &str, raise_on_error: bool) -> FleetResult<()> {
        let result = self.print_next_inner(name).await;
        respond(raise_on_error, result)
    }

    async fn print_next_inner(self: &Arc<Self>, name: &str) -> FleetResult<()> {
        let handle = self.get_handle(name)?;

        let path = {
            let mut rec = handle.record.lock().unwrap();
            if !rec.model_removed {
                return Err(FleetError::value("bed is not clear; call remove_model first"));
            }
            if rec.job_error {
                return Err(FleetError::value("printer has a pending job error; call remove_model first"));
            }
            let job_running = handle
                .print_job
                .lock()
                .unwrap()
                .as_ref()
                .map_or(false, |j| !j.is_finished());
            if job_running || matches!(rec.telemetry.status, Status::SdPrinting | Status::UploadingToSd) {
                return Err(FleetError::value("a print job is already active"));
            }
            let path = match rec.queue.pop_front() {
                Some(path) => path,
                None => return Err(FleetError::value("queue is empty")),
            };
            // Claim the bed for this job immediately, in the same lock scope as the
            // guards above, so a second near-simultaneous caller sees it and bails
            // instead of racing into its own transaction.
            rec.model_removed = false;
            path
        };

        let fleet = self.clone();
        let job_handle = handle.clone();
        let name_arc: Arc<str> = Arc::from(name);

        let join_handle = tokio::spawn(async move {
            fleet.run_print_job(job_handle, name_arc, path).await;
        });
        *handle.print_job.lock().unwrap() = Some(join_handle);

        Ok(())
    }

    async fn run_print_job(self: Arc<Self>, handle: Arc<PrinterHandle>, name: Arc<str>, path: PathBuf) {
        if let Err(e) = transaction::sd_upload(&handle, name.clone(), &path).await {
            let job_error = FleetError::job(format!("SD upload failed: {e}"));
            tracing::warn!("{job_error} for {name}");
            self.persist();
            let _ = transaction::cancel(&handle, name.clone()).await;
            self.persist();
            return;
        }
        self.persist();

        if let Err(e) = transaction::print_from_sd(&handle, name.clone()).await {
            let job_error = FleetError::job(format!("print-from-SD failed: {e}"));
            tracing::warn!("{job_error} for {name}");
            let _ = transaction::cancel(&handle, name.clone()).await;
        }
        self.persist();
    }

    pub async fn remove_model(self: &Arc<Self>, name: &str, raise_on_error: bool) -> FleetResult<()> {
        let result = self.remove_model_inner(name).await;
        respond(raise_on_error, result)
    }

    async fn remove_model_inner(self: &Arc<Self>, name: &str) -> FleetResult<()> {
        let handle = self.get_handle(name)?;

        let job_error = {
            let rec = handle.record.lock().unwrap();
            if matches!(rec.telemetry.status, Status::SdPrinting | Status::UploadingToSd) {
                return Err(FleetError::value("cannot remove the model while printing"));
            }
            if rec.model_removed && !rec.job_error {
                return Err(FleetError::value("model already removed"));
            }
            rec.job_error
        };

        if !job_error {
            transaction::delete_sd_file(&handle, Arc::from(name)).await?;
        }

        let queue_nonempty = {
            let mut rec = handle.record.lock().unwrap();
            rec.staged_local_path = None;
            rec.staged_sd_name = None;
            rec.model_removed = true;
            rec.job_error = false;
            rec.telemetry.current_byte = 0;
            rec.telemetry.total_byte = 0;
            rec.telemetry.percent = 0;
            rec.telemetry.percent_prusa = None;
            rec.telemetry.minutes_remaining_prusa = None;
            rec.telemetry.time_remaining = "N/A".to_string();
            !rec.queue.is_empty()
        };
        self.persist();

        if queue_nonempty {
            self.print_next_inner(name).await?;
        }
        Ok(())
    }

    pub fn list_printer(&self, name: &str) -> Option<TelemetrySnapshot> {
        let printers = self.printers.lock().unwrap();
        printers
            .get(name)
            .map(|h| TelemetrySnapshot::from(&h.record.lock().unwrap().telemetry))
    }

    pub fn list_all_printers(&self) -> Vec<(String, TelemetrySnapshot)> {
        let printers = self.printers.lock().unwrap();
        printers
            .iter()
            .map(|(name, h)| (name.clone(), TelemetrySnapshot::from(&h.record.lock().unwrap().telemetry)))
            .collect()
    }
}

fn describe_port_type(port_type: &tokio_serial::SerialPortType) -> String {
    match port_type {
        tokio_serial::SerialPortType::UsbPort(info) => info
            .product
            .clone()
            .unwrap_or_else(|| "USB serial device".to_string()),
        tokio_serial::SerialPortType::PciPort => "PCI serial device".to_string(),
        tokio_serial::SerialPortType::BluetoothPort => "Bluetooth serial device".to_string(),
        tokio_serial::SerialPortType::Unknown => "n/a".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_printer_is_an_error() {
        let fleet = FleetManager::load(std::env::temp_dir().join("nonexistent_fleet_snapshot.json")).await;
        let err = fleet.get_handle("ghost").unwrap_err();
        assert!(matches!(err, FleetError::Value(_)));
    }

    #[tokio::test]
    async fn add_to_queue_rejects_missing_file() {
        let fleet = FleetManager {
            printers: StdMutex::new(HashMap::new()),
            config_path: std::env::temp_dir().join("unused_fleet_snapshot.json"),
        };
        let handle = Arc::new(PrinterHandle::new(
            PrinterRecord::new("/dev/ttyX".into(), 115200),
            None,
        ));
        fleet.printers.lock().unwrap().insert("p1".to_string(), handle);

        let err = fleet
            .add_to_queue_inner("p1", PathBuf::from("/definitely/not/a/real/path.gcode"))
            .unwrap_err();
        assert!(matches!(err, FleetError::Value(_)));
    }
}
