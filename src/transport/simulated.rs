//! Simulated stage controller.
//!
//! Emulates the controller firmware in-process so the console panel and the
//! integration tests can run without hardware. The emulation follows the
//! device contract only as far as the host can observe it:
//!
//! - `M<n>` starts a move at a fixed speed; `OK` is reported once the travel
//!   time has elapsed (a zero-length move answers on the next read)
//! - `S` halts at the interpolated position and answers nothing
//! - `P` stores the position in EEPROM and answers `SAVED`
//! - `L` adopts the EEPROM value and answers `POS:<n>`
//! - `C<n>` overwrites the position counter, no motion, no answer
//! - Anything else is ignored
//!
//! # Performance Characteristics
//!
//! Default speed is 16 000 steps/s (5 mm/s at 3200 steps/mm). Use
//! [`SimulatedStage::instant`] in tests so moves complete on the next poll.

use super::{LineBuffer, Transport, TransportError};
use crate::protocol::{encode_response, Command, Response};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::debug;

/// Default simulated speed in steps per second.
pub const DEFAULT_STEPS_PER_SEC: f64 = 16_000.0;

/// Most commands kept in the [`SimulatedStage::received`] log.
pub const RECEIVED_LOG_CAP: usize = 1024;

#[derive(Debug, Clone, Copy)]
struct Motion {
    from: i64,
    to: i64,
    started: Instant,
    duration: Duration,
}

impl Motion {
    fn position_at(&self, now: Instant) -> i64 {
        if self.duration.is_zero() {
            return self.to;
        }
        let elapsed = now.saturating_duration_since(self.started);
        let fraction = (elapsed.as_secs_f64() / self.duration.as_secs_f64()).min(1.0);
        let travelled = (self.to.saturating_sub(self.from) as f64 * fraction) as i64;
        self.from.saturating_add(travelled)
    }

    fn is_done(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.started) >= self.duration
    }
}

/// In-process emulation of the stage controller.
#[derive(Debug)]
pub struct SimulatedStage {
    position: i64,
    eeprom: i64,
    steps_per_sec: f64,
    motion: Option<Motion>,
    inbox: LineBuffer,
    outbox: VecDeque<Vec<u8>>,
    received: Vec<Command>,
    open: bool,
}

impl SimulatedStage {
    /// Simulated stage at position 0 with an empty (zero) EEPROM.
    pub fn new(steps_per_sec: f64) -> Self {
        Self {
            position: 0,
            eeprom: 0,
            steps_per_sec,
            motion: None,
            inbox: LineBuffer::new(),
            outbox: VecDeque::new(),
            received: Vec::new(),
            open: true,
        }
    }

    /// A stage whose moves finish immediately.
    pub fn instant() -> Self {
        Self::new(f64::INFINITY)
    }

    /// Start from a previously saved EEPROM value.
    pub fn with_eeprom(mut self, steps: i64) -> Self {
        self.eeprom = steps;
        self
    }

    /// Start at a given physical position.
    pub fn with_position(mut self, steps: i64) -> Self {
        self.position = steps;
        self
    }

    /// Current device position counter (settled or interpolated).
    pub fn position(&self) -> i64 {
        self.motion
            .map_or(self.position, |m| m.position_at(Instant::now()))
    }

    /// Value stored in the emulated EEPROM.
    pub fn eeprom(&self) -> i64 {
        self.eeprom
    }

    /// Whether a move is in progress.
    pub fn is_moving(&self) -> bool {
        self.motion.is_some()
    }

    /// Commands received, oldest first.
    ///
    /// Only the most recent commands are kept; once the log reaches
    /// [`RECEIVED_LOG_CAP`] the older half is dropped.
    pub fn received(&self) -> &[Command] {
        &self.received
    }

    fn travel_time(&self, distance: i64) -> Duration {
        if distance == 0 || !self.steps_per_sec.is_finite() {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(distance.unsigned_abs() as f64 / self.steps_per_sec)
            .unwrap_or(Duration::MAX)
    }

    fn halt(&mut self, now: Instant) {
        if let Some(motion) = self.motion.take() {
            self.position = motion.position_at(now);
        }
    }

    fn reply(&mut self, response: Response) {
        if let Some(line) = encode_response(&response) {
            self.outbox.push_back(line);
        }
    }

    fn execute(&mut self, command: Command, now: Instant) {
        debug!(%command, "Simulated stage received command");
        if self.received.len() >= RECEIVED_LOG_CAP {
            self.received.drain(..RECEIVED_LOG_CAP / 2);
        }
        self.received.push(command);

        match command {
            Command::MoveAbsolute(target) => {
                self.halt(now);
                let duration = self.travel_time(target.saturating_sub(self.position));
                self.motion = Some(Motion {
                    from: self.position,
                    to: target,
                    started: now,
                    duration,
                });
            }
            Command::Stop => self.halt(now),
            Command::SavePosition => {
                self.halt(now);
                self.eeprom = self.position;
                self.reply(Response::Saved);
            }
            Command::LoadPosition => {
                self.halt(now);
                self.position = self.eeprom;
                self.reply(Response::PositionReport(self.eeprom));
            }
            Command::Calibrate(steps) => {
                self.halt(now);
                self.position = steps;
            }
        }
    }

    fn advance(&mut self, now: Instant) {
        if let Some(motion) = self.motion {
            if motion.is_done(now) {
                self.position = motion.to;
                self.motion = None;
                self.reply(Response::Ack);
            }
        }
    }
}

impl Default for SimulatedStage {
    fn default() -> Self {
        Self::new(DEFAULT_STEPS_PER_SEC)
    }
}

impl Transport for SimulatedStage {
    fn read_line(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }
        self.advance(Instant::now());

        Ok(self.outbox.pop_front().map(|mut line| {
            line.pop();
            line
        }))
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }

        let now = Instant::now();
        self.inbox.push(bytes);
        while let Some(line) = self.inbox.next_line() {
            match Command::parse(&line) {
                Some(command) => self.execute(command, now),
                None => debug!(
                    line = %String::from_utf8_lossy(&line),
                    "Simulated stage ignored unknown command"
                ),
            }
        }
        Ok(())
    }

    fn discard_input(&mut self) -> Result<usize, TransportError> {
        let dropped = self.outbox.iter().map(Vec::len).sum();
        self.outbox.clear();
        Ok(dropped)
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.open = false;
        Ok(())
    }

    fn describe(&self) -> String {
        "simulated".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all(stage: &mut SimulatedStage) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = stage.read_line().unwrap() {
            lines.push(String::from_utf8(line).unwrap());
        }
        lines
    }

    #[test]
    fn instant_move_acknowledges_on_next_read() {
        let mut stage = SimulatedStage::instant();
        stage.write_all(b"M3200\n").unwrap();
        assert_eq!(read_all(&mut stage), vec!["OK"]);
        assert_eq!(stage.position(), 3200);
        assert!(!stage.is_moving());
    }

    #[test]
    fn slow_move_is_not_acknowledged_early() {
        let mut stage = SimulatedStage::new(1.0);
        stage.write_all(b"M1000\n").unwrap();
        assert!(read_all(&mut stage).is_empty());
        assert!(stage.is_moving());

        stage.write_all(b"S\n").unwrap();
        assert!(!stage.is_moving());
        assert!(read_all(&mut stage).is_empty());
        assert!(stage.position() < 1000);
    }

    #[test]
    fn eeprom_save_and_load() {
        let mut stage = SimulatedStage::instant().with_position(640);
        stage.write_all(b"P\n").unwrap();
        assert_eq!(read_all(&mut stage), vec!["SAVED"]);
        assert_eq!(stage.eeprom(), 640);

        stage.write_all(b"C0\n").unwrap();
        assert_eq!(stage.position(), 0);
        assert!(read_all(&mut stage).is_empty());

        stage.write_all(b"L\n").unwrap();
        assert_eq!(read_all(&mut stage), vec!["POS:640"]);
        assert_eq!(stage.position(), 640);
    }

    #[test]
    fn unknown_commands_are_ignored_but_parsed_ones_recorded() {
        let mut stage = SimulatedStage::instant();
        stage.write_all(b"HELLO\nM5\n").unwrap();
        assert_eq!(stage.received(), &[Command::MoveAbsolute(5)]);
    }

    #[test]
    fn received_log_is_bounded() {
        let mut stage = SimulatedStage::instant();
        for steps in 0..(RECEIVED_LOG_CAP as i64 + 10) {
            stage.write_all(format!("C{steps}\n").as_bytes()).unwrap();
        }
        let log = stage.received();
        assert!(log.len() <= RECEIVED_LOG_CAP);
        assert_eq!(
            log.last(),
            Some(&Command::Calibrate(RECEIVED_LOG_CAP as i64 + 9))
        );
    }

    #[test]
    fn extreme_targets_do_not_overflow() {
        let mut stage = SimulatedStage::new(1.0).with_position(100);
        stage.write_all(format!("M{}\n", i64::MIN).as_bytes()).unwrap();
        assert!(stage.is_moving());
        let mid = stage.position();
        assert!(mid <= 100);

        stage.write_all(b"S\n").unwrap();
        stage.write_all(format!("C{}\n", i64::MIN).as_bytes()).unwrap();
        stage.write_all(format!("M{}\n", i64::MAX).as_bytes()).unwrap();
        assert!(stage.position() < 0);
        assert!(stage.is_moving());
    }
}
