//! Custom error types for the stage controller.
//!
//! `StageError` is the single error type surfaced by the library. Following the
//! propagation policy of the driver, only *structural* failures become errors:
//!
//! - **`Config`**: the layered configuration could not be extracted (bad TOML,
//!   wrong types, malformed environment overrides).
//! - **`Configuration`**: values parsed fine but are semantically invalid
//!   (e.g. a zero baud rate or a negative travel range).
//! - **`Io`**: plain `std::io::Error` outside the transport (stdin, files).
//! - **`SerialOpen`**: the serial port could not be opened. The session never
//!   reaches `Connected` and the caller must refuse to start.
//! - **`NotConnected`**: an operation was attempted on a session whose link is
//!   closed or lost. Nothing is sent and nothing new is queued.
//! - **`Transport`**: a write (or read) on an open link failed.
//! - **`Logging`**: the global log subscriber could not be installed.
//!
//! Expected conditions such as malformed response lines, save-confirmation
//! timeouts and limit-reached no-ops are *not* errors; they are reported through
//! [`crate::session::MoveOutcome`], [`crate::session::SaveOutcome`] and session
//! events.

use crate::transport::TransportError;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type StageResult<T> = std::result::Result<T, StageError>;

/// Errors surfaced by the stage driver.
#[derive(Error, Debug)]
pub enum StageError {
    /// Configuration file or environment could not be read or parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration parsed but holds an unusable value.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Local I/O failure outside the serial link.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The serial port could not be opened.
    #[error("Failed to open serial port '{port}': {source}")]
    SerialOpen {
        /// Port path as configured
        port: String,
        /// Underlying `serialport` error
        #[source]
        source: serialport::Error,
    },

    /// The session is disconnected or closed.
    #[error("Serial port not connected")]
    NotConnected,

    /// Reading from or writing to the link failed.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The log subscriber could not be installed.
    #[error("Logging setup failed: {0}")]
    Logging(String),
}

impl StageError {
    /// Whether the error means the link to the device is gone for good.
    ///
    /// A session that sees one of these transitions to `Disconnected` and will
    /// not send anything again until a new session is opened.
    pub fn is_link_loss(&self) -> bool {
        match self {
            StageError::NotConnected => true,
            StageError::Transport(err) => err.is_link_loss(),
            _ => false,
        }
    }
}
