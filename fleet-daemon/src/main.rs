//! # fleet-daemon
//!
//! Thin process entry point: wires up logging, loads the printer fleet from
//! its snapshot, and runs until interrupted. No fleet logic lives here.

use std::path::PathBuf;

use fleet_manager::{FleetManager, DEFAULT_SNAPSHOT_PATH};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn setup_logging() {
    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_env_var("FLEET_LOG")
        .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
        .from_env_lossy();
    let format_layer = tracing_subscriber::fmt::layer().compact();
    tracing_subscriber::registry()
        .with(env_filter)
        .with(format_layer)
        .init();
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    setup_logging();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SNAPSHOT_PATH));

    tracing::info!("loading fleet snapshot from {config_path:?}");
    let fleet = FleetManager::load(config_path).await;
    tracing::info!("fleet manager running with {} printer(s); press Ctrl+C to stop", fleet.list_all_printers().len());

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("shutdown signal received");
            std::process::ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("failed to listen for shutdown signal: {e}");
            std::process::ExitCode::FAILURE
        }
    }
}
