//! Mock transport for testing the session without hardware.
//!
//! This module provides `MockTransport`, which implements [`Transport`], and a
//! corresponding `MockDeviceHarness` to script the device side from a test.
//!
//! # Architecture
//!
//! The mock uses a pair of unbounded channels to simulate the serial link:
//! - `MockTransport` (given to the session): reads what the harness sends,
//!   forwards every write to the harness
//! - `MockDeviceHarness` (kept in the test): injects response lines and
//!   asserts on the command lines written by the session
//!
//! Dropping the harness (or calling [`MockDeviceHarness::disconnect`]) makes
//! the transport report a lost link on the next read or write.
//!
//! # Example
//!
//! ```rust
//! use stage_control::transport::{mock, Transport};
//!
//! let (mut port, mut harness) = mock::new();
//! port.write_all(b"M3200\n").unwrap();
//! harness.expect_line("M3200");
//!
//! harness.send_line("OK");
//! assert_eq!(port.read_line().unwrap(), Some(b"OK".to_vec()));
//! ```

use super::{LineBuffer, Transport, TransportError};
use crate::protocol::Command;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// The session-facing side of the mock link.
#[derive(Debug)]
pub struct MockTransport {
    /// Channel to send written data to the harness
    writes_tx: UnboundedSender<Vec<u8>>,
    /// Channel to receive data from the harness to be read
    reads_rx: UnboundedReceiver<Vec<u8>>,
    /// Data received from the harness but not yet returned as lines
    lines: LineBuffer,
    open: bool,
}

/// The test-facing side for controlling the mock link.
#[derive(Debug)]
pub struct MockDeviceHarness {
    /// Channel to receive data written by the session
    writes_rx: UnboundedReceiver<Vec<u8>>,
    /// Channel to send data to the session
    reads_tx: UnboundedSender<Vec<u8>>,
    /// Written data not yet consumed by an assertion
    write_buffer: LineBuffer,
}

/// Creates a new connected pair of `MockTransport` and `MockDeviceHarness`.
pub fn new() -> (MockTransport, MockDeviceHarness) {
    let (session_to_harness_tx, session_to_harness_rx) = mpsc::unbounded_channel();
    let (harness_to_session_tx, harness_to_session_rx) = mpsc::unbounded_channel();

    let port = MockTransport {
        writes_tx: session_to_harness_tx,
        reads_rx: harness_to_session_rx,
        lines: LineBuffer::new(),
        open: true,
    };

    let harness = MockDeviceHarness {
        writes_rx: session_to_harness_rx,
        reads_tx: harness_to_session_tx,
        write_buffer: LineBuffer::new(),
    };

    (port, harness)
}

// =============================================================================
// MockTransport
// =============================================================================

impl Transport for MockTransport {
    fn read_line(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }

        loop {
            match self.reads_rx.try_recv() {
                Ok(chunk) => self.lines.push(&chunk),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    // Deliver what arrived before the link dropped.
                    return match self.lines.next_line() {
                        Some(line) => Ok(Some(line)),
                        None => Err(TransportError::Disconnected),
                    };
                }
            }
        }

        Ok(self.lines.next_line())
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }
        self.writes_tx
            .send(bytes.to_vec())
            .map_err(|_| TransportError::Disconnected)
    }

    fn discard_input(&mut self) -> Result<usize, TransportError> {
        let mut dropped = self.lines.clear();
        while let Ok(chunk) = self.reads_rx.try_recv() {
            dropped += chunk.len();
        }
        Ok(dropped)
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.open = false;
        self.lines.clear();
        Ok(())
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}

// =============================================================================
// MockDeviceHarness
// =============================================================================

impl MockDeviceHarness {
    /// Sends one response line (a `\n` is appended).
    ///
    /// # Panics
    /// Panics if the transport has been dropped.
    pub fn send_line(&self, line: &str) {
        let mut bytes = line.as_bytes().to_vec();
        bytes.push(b'\n');
        self.send_raw(&bytes);
    }

    /// Sends raw bytes exactly as given, e.g. partial or garbled lines.
    ///
    /// # Panics
    /// Panics if the transport has been dropped.
    #[allow(clippy::expect_used)]
    pub fn send_raw(&self, bytes: &[u8]) {
        self.reads_tx
            .send(bytes.to_vec())
            .expect("Failed to send response: transport dropped");
    }

    /// All complete lines written since the last call, without terminators.
    pub fn take_written(&mut self) -> Vec<String> {
        while let Ok(chunk) = self.writes_rx.try_recv() {
            self.write_buffer.push(&chunk);
        }

        let mut lines = Vec::new();
        while let Some(line) = self.write_buffer.next_line() {
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Like [`take_written`](Self::take_written), parsed as device commands.
    ///
    /// Unparseable lines are skipped.
    pub fn take_commands(&mut self) -> Vec<Command> {
        self.take_written()
            .iter()
            .filter_map(|line| Command::parse(line.as_bytes()))
            .collect()
    }

    /// Asserts that exactly one new line was written and that it matches.
    ///
    /// # Panics
    /// Panics on any other write pattern.
    pub fn expect_line(&mut self, expected: &str) {
        let written = self.take_written();
        assert_eq!(
            written,
            vec![expected.to_string()],
            "Mismatch in expected write. Expected `{expected}`, got {written:?}."
        );
    }

    /// Asserts that nothing was written since the last check.
    ///
    /// # Panics
    /// Panics if any line was written.
    pub fn expect_silence(&mut self) {
        let written = self.take_written();
        assert!(written.is_empty(), "Expected no writes, got {written:?}");
    }

    /// Drops the device side; the transport reports a lost link.
    pub fn disconnect(self) {}
}
