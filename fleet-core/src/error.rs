use std::io;

/// Failures that can occur at the transport layer: opening a device, or
/// talking to one that's already open.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("could not open serial port: {0}")]
    Transport(#[from] tokio_serial::Error),

    #[error("device opened but never responded to M115")]
    Handshake,

    #[error("I/O error talking to printer: {0}")]
    Io(#[from] io::Error),
}
