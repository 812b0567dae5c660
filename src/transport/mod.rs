//! Byte-stream transports to the stage controller.
//!
//! The session only needs a duplex, line-oriented link that can be polled
//! without blocking. [`Transport`] captures exactly that; the concrete
//! implementations are:
//!
//! - [`serial::SerialTransport`]: a real RS-232/USB-serial port (`serialport`)
//! - [`mock::MockTransport`]: a scripted test double driven by a
//!   [`mock::MockDeviceHarness`]
//! - [`simulated::SimulatedStage`]: an in-process emulation of the controller
//!   firmware, used by `stage-control run --simulate` and integration tests

pub mod mock;
pub mod serial;
pub mod simulated;

use std::io;
use thiserror::Error;
use tracing::debug;

pub use mock::{MockDeviceHarness, MockTransport};
pub use serial::SerialTransport;
pub use simulated::SimulatedStage;

/// Longest line accepted before the partial input is discarded as garbage.
pub const MAX_LINE_LEN: usize = 256;

/// Errors raised by a transport.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The device went away (unplugged, hung up).
    #[error("Link to device lost")]
    Disconnected,

    /// The transport was closed by the host.
    #[error("Transport already closed")]
    Closed,

    /// Read or write failed.
    #[error("Serial I/O error: {0}")]
    Io(#[from] io::Error),

    /// Port query or configuration failed.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

impl TransportError {
    /// Whether this error means the link is gone (unplugged, closed, EOF).
    pub fn is_link_loss(&self) -> bool {
        match self {
            TransportError::Disconnected | TransportError::Closed => true,
            TransportError::Io(err) => {
                err.raw_os_error().is_some_and(os_error_is_link_loss)
                    || io_kind_is_link_loss(err.kind())
            }
            TransportError::Serial(err) => match err.kind() {
                serialport::ErrorKind::NoDevice => true,
                serialport::ErrorKind::Io(kind) => io_kind_is_link_loss(kind),
                _ => false,
            },
        }
    }
}

/// errno values a tty reports once the device behind it has gone away.
#[cfg(unix)]
pub(crate) fn os_error_is_link_loss(code: i32) -> bool {
    matches!(code, libc::EIO | libc::ENXIO | libc::ENODEV)
}

#[cfg(not(unix))]
pub(crate) fn os_error_is_link_loss(_code: i32) -> bool {
    false
}

fn io_kind_is_link_loss(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotFound
            | io::ErrorKind::PermissionDenied
    )
}

/// A duplex, line-oriented link to the device.
///
/// # Contract
/// - `read_line` never blocks: it returns `Ok(None)` when no complete line is
///   available yet. Returned lines have the `\n` removed.
/// - A dropped link is reported as an error for which
///   [`TransportError::is_link_loss`] is true.
/// - Implementations are owned by exactly one session; no internal locking.
pub trait Transport: Send {
    /// Return the next complete line, if any.
    fn read_line(&mut self) -> Result<Option<Vec<u8>>, TransportError>;

    /// Write all bytes and flush.
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Throw away unread input. Returns the number of bytes discarded locally.
    fn discard_input(&mut self) -> Result<usize, TransportError>;

    /// Whether the link is open.
    fn is_open(&self) -> bool;

    /// Close the link. Closing twice is not an error.
    fn close(&mut self) -> Result<(), TransportError>;

    /// Human-readable description for logs (e.g. the port path).
    fn describe(&self) -> String;
}

/// Accumulates raw bytes and yields `\n`-terminated lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    /// Empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes.
    ///
    /// If the unterminated tail grows beyond [`MAX_LINE_LEN`] it is dropped.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);

        let tail_start = self
            .buf
            .iter()
            .rposition(|&b| b == b'\n')
            .map_or(0, |pos| pos + 1);
        let tail_len = self.buf.len() - tail_start;
        if tail_len > MAX_LINE_LEN {
            debug!(discarded = tail_len, "Discarding unterminated serial input");
            self.buf.truncate(tail_start);
        }
    }

    /// Pop the next complete line without its terminator.
    pub fn next_line(&mut self) -> Option<Vec<u8>> {
        let end = self.buf.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.buf.drain(..=end).collect();
        line.pop();
        Some(line)
    }

    /// Drop everything buffered. Returns the number of bytes dropped.
    pub fn clear(&mut self) -> usize {
        let n = self.buf.len();
        self.buf.clear();
        n
    }

    /// Bytes buffered, complete lines and partial tail.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
