//! Serial Channel
//!
//! Owns the lifetime of one transport connection to the sensor board:
//!
//! - `open`: bounded retries with a fixed backoff, then a settle delay so the
//!   board can finish its reset after DTR toggles on open
//! - `read_line`: blocking read bounded by the per-call timeout; `Ok(None)` on
//!   timeout, never blocks indefinitely
//! - `close`: idempotent, infallible; also runs on drop
//!
//! All calls block the calling thread. The session controller only touches a
//! channel from `spawn_blocking` context.

use std::io::{self, BufRead, BufReader, Read};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::defaults::{
    DEFAULT_OPEN_ATTEMPTS, DEFAULT_READ_TIMEOUT_MS, DEFAULT_RETRY_BACKOFF_MS, DEFAULT_SETTLE_MS,
    MAX_LINE_BYTES,
};

/// Serial channel errors
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to open {port} after {attempts} attempts: {last_error}")]
    OpenFailed {
        port: String,
        attempts: u32,
        last_error: String,
    },

    #[error("transport error on {port}: {source}")]
    Transport {
        port: String,
        #[source]
        source: io::Error,
    },

    #[error("channel {0} is closed")]
    Closed(String),
}

// ============================================================================
// Transport Seam
// ============================================================================

/// A connected line-oriented byte stream.
pub trait LineTransport: Send {
    /// Block until one complete line (newline included) arrives or the
    /// configured read timeout elapses.
    ///
    /// Returns `Ok(None)` on timeout. Partial lines must be retained across
    /// calls so a timeout in the middle of a line does not split a frame.
    fn read_line(&mut self) -> io::Result<Option<Vec<u8>>>;
}

/// Opens transports. One `connect` call is one physical open attempt.
pub trait TransportConnector: Send + Sync {
    fn connect(&self, settings: &SerialSettings) -> io::Result<Box<dyn LineTransport>>;

    /// Human-readable name for logging (e.g. "serial", "simulated").
    fn name(&self) -> &str;
}

/// Connection parameters for one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    pub port: String,
    pub baud_rate: u32,
    pub open_attempts: u32,
    pub retry_backoff: Duration,
    pub settle: Duration,
    pub read_timeout: Duration,
}

impl SerialSettings {
    pub fn new(port: &str, baud_rate: u32) -> Self {
        Self {
            port: port.to_string(),
            baud_rate,
            open_attempts: DEFAULT_OPEN_ATTEMPTS,
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
            settle: Duration::from_millis(DEFAULT_SETTLE_MS),
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
        }
    }
}

// ============================================================================
// Serial Channel
// ============================================================================

/// Exactly one open transport, or none once closed.
pub struct SerialChannel {
    port: String,
    transport: Option<Box<dyn LineTransport>>,
    lines_read: u64,
    timeouts: u64,
}

impl SerialChannel {
    /// Open a channel with bounded retries.
    ///
    /// Sleeps `retry_backoff` between failed attempts (not after the last one)
    /// and `settle` after a successful open.
    pub fn open(
        connector: &dyn TransportConnector,
        settings: &SerialSettings,
    ) -> Result<Self, ChannelError> {
        let attempts = settings.open_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match connector.connect(settings) {
                Ok(transport) => {
                    info!(
                        port = %settings.port,
                        baud = settings.baud_rate,
                        transport = connector.name(),
                        attempt = attempt,
                        "Serial channel opened"
                    );
                    if !settings.settle.is_zero() {
                        debug!(settle_ms = settings.settle.as_millis() as u64, "Waiting for board reset");
                        std::thread::sleep(settings.settle);
                    }
                    return Ok(Self {
                        port: settings.port.clone(),
                        transport: Some(transport),
                        lines_read: 0,
                        timeouts: 0,
                    });
                }
                Err(e) => {
                    warn!(
                        port = %settings.port,
                        attempt = attempt,
                        max_attempts = attempts,
                        error = %e,
                        "Serial open attempt failed"
                    );
                    last_error = e.to_string();
                    if attempt < attempts {
                        std::thread::sleep(settings.retry_backoff);
                    }
                }
            }
        }

        error!(port = %settings.port, attempts = attempts, "Serial open exhausted, giving up");
        Err(ChannelError::OpenFailed {
            port: settings.port.clone(),
            attempts,
            last_error,
        })
    }

    /// Read one line. `Ok(None)` means the read timed out.
    pub fn read_line(&mut self) -> Result<Option<Vec<u8>>, ChannelError> {
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| ChannelError::Closed(self.port.clone()))?;

        match transport.read_line() {
            Ok(Some(line)) => {
                self.lines_read += 1;
                Ok(Some(line))
            }
            Ok(None) => {
                self.timeouts += 1;
                Ok(None)
            }
            Err(source) => Err(ChannelError::Transport {
                port: self.port.clone(),
                source,
            }),
        }
    }

    /// Release the transport. Safe to call any number of times.
    pub fn close(&mut self) {
        if let Some(transport) = self.transport.take() {
            drop(transport);
            info!(
                port = %self.port,
                lines_read = self.lines_read,
                timeouts = self.timeouts,
                "Serial channel closed"
            );
        }
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    pub fn port(&self) -> &str {
        &self.port
    }
}

impl Drop for SerialChannel {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for SerialChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialChannel")
            .field("port", &self.port)
            .field("open", &self.is_open())
            .field("lines_read", &self.lines_read)
            .finish()
    }
}

// ============================================================================
// Hardware Transport (serialport crate)
// ============================================================================

/// Opens real serial devices.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialPortConnector;

impl TransportConnector for SerialPortConnector {
    fn connect(&self, settings: &SerialSettings) -> io::Result<Box<dyn LineTransport>> {
        let port = serialport::new(&settings.port, settings.baud_rate)
            .timeout(settings.read_timeout)
            .open()?;
        Ok(Box::new(SerialPortTransport::new(BufReader::new(port))))
    }

    fn name(&self) -> &str {
        "serial"
    }
}

/// Line reader over a `serialport` handle.
struct SerialPortTransport<R> {
    reader: R,
    /// Bytes of a line that straddled a read timeout.
    pending: Vec<u8>,
    /// Inside a line that already exceeded `MAX_LINE_BYTES`; skip to its newline.
    overlong: bool,
}

impl<R: BufRead> SerialPortTransport<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            pending: Vec::with_capacity(128),
            overlong: false,
        }
    }
}

impl<R: BufRead + Send> LineTransport for SerialPortTransport<R> {
    fn read_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        // pending is always shorter than the cap here, so room > 0
        let room = MAX_LINE_BYTES.saturating_sub(self.pending.len()) as u64;
        match (&mut self.reader).take(room).read_until(b'\n', &mut self.pending) {
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "serial device closed the stream",
            )),
            Ok(_) if self.pending.ends_with(b"\n") => {
                let line = std::mem::take(&mut self.pending);
                if std::mem::take(&mut self.overlong) {
                    debug!(tail_bytes = line.len(), "Discarded tail of overlong line");
                    return Ok(None);
                }
                Ok(Some(line))
            }
            Ok(_) if self.pending.len() >= MAX_LINE_BYTES => {
                if !self.overlong {
                    warn!(max_bytes = MAX_LINE_BYTES, "Dropping malformed line with no terminator");
                }
                self.overlong = true;
                self.pending.clear();
                Ok(None)
            }
            // Data ended without a newline; keep it for the next call
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(e),
        }
    }
}
