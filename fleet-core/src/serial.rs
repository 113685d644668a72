//! Thin async frame over a single serial device. No retries, no policy —
//! just "write a line" and "read lines back".

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use crate::error::Error;

/// A single read is never allowed to block indefinitely; after this long with
/// nothing arriving, the port is considered idle.
const IDLE_READ_TIMEOUT: Duration = Duration::from_millis(300);
/// How long to wait for any reply during the open handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);
/// How long `try_read_line` waits before reporting "nothing buffered".
const DRAIN_PEEK_TIMEOUT: Duration = Duration::from_millis(10);

/// Wraps one open line-oriented device. Generic over the underlying
/// read/write halves so tests can swap in an in-memory duplex stream instead
/// of a real `tokio_serial::SerialStream`; `SerialTransport` (the type alias
/// below) is what production code actually uses.
///
/// Exclusivity across concurrent tasks is not enforced here; see
/// `fleet-manager`'s transaction engine for that.
pub struct LineTransport<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    connected: bool,
}

/// The production transport: a real serial port.
pub type SerialTransport = LineTransport<SerialStream>;

impl SerialTransport {
    /// Open `port` at `baud` and perform the `M115` handshake. `connected` is
    /// true iff the firmware answered with at least one non-empty line.
    #[tracing::instrument(level = "debug")]
    pub async fn open(port: &str, baud: u32) -> Result<Self, Error> {
        let stream = tokio_serial::new(port, baud).open_native_async()?;
        Self::handshake(stream).await
    }
}

impl<S> LineTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an already-open stream and perform the `M115` handshake. Shared
    /// by `SerialTransport::open` and by tests constructing a fake transport
    /// over `tokio::io::duplex`.
    pub async fn handshake(stream: S) -> Result<Self, Error> {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut this = Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            connected: false,
        };

        this.writer.write_all(b"M115\n").await?;
        this.writer.flush().await?;

        let mut buf = String::new();
        match tokio::time::timeout(HANDSHAKE_TIMEOUT, this.reader.read_line(&mut buf)).await {
            Ok(Ok(n)) if n > 0 && !buf.trim().is_empty() => {
                tracing::debug!("handshake reply: {}", buf.trim());
                this.connected = true;
                Ok(this)
            }
            _ => Err(Error::Handshake),
        }
    }

    pub fn connected(&self) -> bool {
        self.connected
    }

    /// Write `line` (a newline is appended) and collect response lines until
    /// a bare `ok` arrives or the port goes idle. The `ok` line itself is not
    /// included in the returned lines.
    ///
    /// `expect_ok` only affects how hard we wait: when true we block up to
    /// the idle timeout looking for `ok`; when false (status polls like
    /// `M105`, which Marlin may not `ok`) we stop as soon as the port is idle.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn send(&mut self, line: &str, expect_ok: bool) -> Vec<String> {
        let mut framed = String::with_capacity(line.len() + 1);
        framed.push_str(line);
        framed.push('\n');

        if let Err(e) = self.writer.write_all(framed.as_bytes()).await {
            tracing::warn!("write to printer failed: {e}");
            self.connected = false;
            return Vec::new();
        }
        if let Err(e) = self.writer.flush().await {
            tracing::warn!("flush to printer failed: {e}");
            self.connected = false;
            return Vec::new();
        }

        let mut lines = Vec::new();
        loop {
            let mut buf = String::new();
            match tokio::time::timeout(IDLE_READ_TIMEOUT, self.reader.read_line(&mut buf)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(_)) => {
                    let trimmed = buf.trim();
                    if trimmed.is_empty() {
                        if !expect_ok {
                            break;
                        }
                        continue;
                    }
                    if trimmed == "ok" {
                        break;
                    }
                    lines.push(trimmed.to_string());
                }
                Ok(Err(e)) => {
                    tracing::warn!("read from printer failed: {e}");
                    self.connected = false;
                    break;
                }
                Err(_elapsed) => break,
            }
        }
        lines
    }

    /// A fast, near-non-blocking read used by the monitor loop to drain
    /// whatever is already buffered before it issues a poll.
    pub async fn try_read_line(&mut self) -> Option<String> {
        let mut buf = String::new();
        match tokio::time::timeout(DRAIN_PEEK_TIMEOUT, self.reader.read_line(&mut buf)).await {
            Ok(Ok(n)) if n > 0 => {
                let trimmed = buf.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            }
            _ => None,
        }
    }

    pub async fn close(mut self) {
        let _ = self.writer.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_timeout_shorter_than_handshake_timeout() {
        assert!(IDLE_READ_TIMEOUT < HANDSHAKE_TIMEOUT);
    }

    /// A fake firmware: answers the `M115` handshake, then echoes `ok` to
    /// every line it receives and never sends anything unsolicited.
    async fn spawn_fake_firmware(mut device: tokio::io::DuplexStream) {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
        let (read_half, mut write_half) = tokio::io::split(&mut device);
        let mut reader = BufReader::new(read_half);
        write_half.write_all(b"ok\n").await.unwrap();
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    if write_half.write_all(b"ok\n").await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    }

    #[tokio::test]
    async fn handshake_succeeds_against_a_fake_firmware() {
        let (client, server) = tokio::io::duplex(256);
        tokio::spawn(spawn_fake_firmware(server));
        let transport = LineTransport::handshake(client).await.unwrap();
        assert!(transport.connected());
    }

    #[tokio::test]
    async fn send_collects_lines_until_ok() {
        let (client, server) = tokio::io::duplex(256);
        tokio::spawn(spawn_fake_firmware(server));
        let mut transport = LineTransport::handshake(client).await.unwrap();
        let lines = transport.send("M105", true).await;
        assert!(lines.is_empty());
    }
}
