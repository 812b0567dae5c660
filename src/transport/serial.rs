//! Serial port transport.
//!
//! Wraps a blocking `serialport` handle and makes it pollable: `read_line`
//! only reads what `bytes_to_read()` reports as already buffered by the OS, so
//! a host loop can call it every tick without stalling.
//!
//! Standard settings are applied: 8N1, no flow control. The controller resets
//! when the port opens, so [`SerialTransport::open`] waits for the configured
//! settle delay before returning.

use super::{LineBuffer, Transport, TransportError};
use crate::config::SerialConfig;
use crate::error::{StageError, StageResult};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, SerialPortInfo, StopBits};
use std::io::{self, Read, Write};
use std::time::Duration;
use tracing::{debug, info, trace};

/// Chunk size for a single read from the OS buffer.
const READ_CHUNK: usize = 256;

/// A line-oriented serial link.
pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
    name: String,
    lines: LineBuffer,
}

impl SerialTransport {
    /// Open the configured port and wait for the controller to come up.
    ///
    /// # Errors
    /// Returns [`StageError::SerialOpen`] if the port cannot be opened.
    pub fn open(settings: &SerialConfig) -> StageResult<Self> {
        let port = serialport::new(&settings.port, settings.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(settings.read_timeout_ms))
            .open()
            .map_err(|source| StageError::SerialOpen {
                port: settings.port.clone(),
                source,
            })?;

        info!(
            port = %settings.port,
            baud = settings.baud_rate,
            "Serial port opened"
        );

        if settings.settle_delay_ms > 0 {
            debug!(delay_ms = settings.settle_delay_ms, "Waiting for controller reset");
            std::thread::sleep(Duration::from_millis(settings.settle_delay_ms));
        }

        Ok(Self::from_port(port, settings.port.clone()))
    }

    /// Wrap an already-open port.
    pub fn from_port(port: Box<dyn SerialPort>, name: String) -> Self {
        Self {
            port: Some(port),
            name,
            lines: LineBuffer::new(),
        }
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPort>, TransportError> {
        self.port.as_mut().ok_or(TransportError::Closed)
    }
}

impl Transport for SerialTransport {
    fn read_line(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        if let Some(line) = self.lines.next_line() {
            return Ok(Some(line));
        }

        let port = self.port.as_mut().ok_or(TransportError::Closed)?;
        let available = port.bytes_to_read().map_err(serial_link_error)? as usize;
        if available == 0 {
            return Ok(None);
        }

        let mut chunk = [0u8; READ_CHUNK];
        let want = available.min(READ_CHUNK);
        match port.read(&mut chunk[..want]) {
            Ok(n) => {
                trace!(bytes = n, "Serial read");
                self.lines.push(&chunk[..n]);
            }
            Err(err) if err.kind() == io::ErrorKind::TimedOut => return Ok(None),
            Err(err) => return Err(io_link_error(err)),
        }

        Ok(self.lines.next_line())
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let port = self.port_mut()?;
        port.write_all(bytes).map_err(io_link_error)?;
        port.flush().map_err(io_link_error)?;
        Ok(())
    }

    fn discard_input(&mut self) -> Result<usize, TransportError> {
        let dropped = self.lines.clear();
        self.port_mut()?
            .clear(ClearBuffer::Input)
            .map_err(serial_link_error)?;
        Ok(dropped)
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if self.port.take().is_some() {
            info!(port = %self.name, "Serial port closed");
        }
        self.lines.clear();
        Ok(())
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

/// Map an error from a port query (`bytes_to_read`, `clear`).
///
/// `serialport` reports errno values it has no mapping for, EIO from a
/// hung-up tty among them, as `ErrorKind::Unknown`.
fn serial_link_error(err: serialport::Error) -> TransportError {
    match err.kind() {
        serialport::ErrorKind::Unknown | serialport::ErrorKind::NoDevice => {
            debug!(error = %err, "Serial port query failed, treating as unplugged");
            TransportError::Disconnected
        }
        _ => TransportError::Serial(err),
    }
}

/// Map an error from reading or writing the port.
///
/// `serialport` turns unmapped errno values into `io::ErrorKind::Other`
/// without keeping the raw code, so on a serial port that kind also means
/// the device went away.
fn io_link_error(err: io::Error) -> TransportError {
    let unplugged = err.raw_os_error().is_some_and(super::os_error_is_link_loss)
        || err.kind() == io::ErrorKind::Other;
    if unplugged {
        debug!(error = %err, "Serial I/O failed, treating as unplugged");
        TransportError::Disconnected
    } else {
        TransportError::Io(err)
    }
}

/// Enumerate serial ports present on this machine.
pub fn list_ports() -> StageResult<Vec<SerialPortInfo>> {
    serialport::available_ports().map_err(|err| StageError::Transport(err.into()))
}
