//! Session controller.
//!
//! A [`Session`] owns the transport for one connection to the stage and turns
//! user requests into protocol traffic:
//!
//! ```text
//! UI ──move_*()──▶ PositionModel ──target──▶ Dispatcher ──pump()──▶ codec ──▶ Transport
//! UI ◀──events──── Session ◀──decode()──── poll_incoming() ◀─────────────────── Transport
//! ```
//!
//! The session is single-threaded and poll-driven. Nothing happens in the
//! background: a host loop calls [`Session::poll_incoming`] and
//! [`Session::pump`] (or [`Session::tick`], which does both) on every
//! iteration, and user actions call the operations directly from the same
//! thread. The only blocking call is [`Session::save_position`], bounded by the
//! configured save timeout.
//!
//! State changes the UI cares about are published as [`SessionEvent`]s on an
//! unbounded channel returned by [`Session::new`]; a front end drains it with
//! `try_recv` (or `recv` from an async loop).
//!
//! # Example
//!
//! ```rust
//! use stage_control::config::StageConfig;
//! use stage_control::session::{MoveOutcome, Session};
//! use stage_control::transport::SimulatedStage;
//!
//! let config = StageConfig::default();
//! let (mut session, _events) = Session::from_config(SimulatedStage::instant(), &config);
//!
//! let outcome = session.move_relative(1.0)?;
//! assert!(matches!(outcome, MoveOutcome::Queued { target: 3200, .. }));
//! session.pump()?;          // sends M3200
//! session.poll_incoming()?; // reads OK
//! assert!(!session.is_busy());
//! # Ok::<(), stage_control::StageError>(())
//! ```

use crate::config::{StageConfig, TimingConfig};
use crate::dispatcher::Dispatcher;
use crate::error::{StageError, StageResult};
use crate::position::{MovePlan, PositionModel};
use crate::protocol::{decode, encode, Command, Response};
use crate::transport::Transport;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, instrument, trace, warn};

/// Receiving end of the session's event stream.
pub type SessionEvents = UnboundedReceiver<SessionEvent>;

/// Timing knobs for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    /// Upper bound on the `SAVED` wait in [`Session::save_position`].
    pub save_timeout: Duration,
    /// Sleep between reads while waiting for `SAVED`.
    pub poll_interval: Duration,
    /// Move-acknowledgment timeout; `None` waits forever.
    pub move_timeout: Option<Duration>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&TimingConfig::default())
    }
}

impl From<&TimingConfig> for SessionSettings {
    fn from(timing: &TimingConfig) -> Self {
        Self {
            save_timeout: timing.save_timeout(),
            poll_interval: timing.poll_interval(),
            move_timeout: timing.move_timeout(),
        }
    }
}

/// Coarse session state for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Link closed or lost; nothing can be sent.
    Disconnected,
    /// Connected, no move in flight.
    Idle,
    /// Connected, a move is awaiting `OK`.
    Busy,
}

/// Where a position update came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionSource {
    /// Predicted locally when a move was queued.
    Optimistic,
    /// Reported by the device (`POS:<n>`); overrides any prediction.
    Device,
    /// Set by the user through calibration.
    Calibration,
}

/// Notifications for the front end.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Movement-issuing controls should be enabled (`true`) or disabled.
    ControlsEnabled(bool),
    /// The displayed position changed.
    PositionChanged {
        /// New position in steps
        steps: i64,
        /// Same position in mm
        mm: f64,
        /// Where the value came from
        source: PositionSource,
    },
    /// A move was refused because the stage already sits at a travel bound.
    LimitReached {
        /// The bound, in steps
        steps: i64,
    },
    /// A move was written to the device.
    MoveDispatched {
        /// Absolute target in steps
        target: i64,
    },
    /// The device acknowledged the in-flight move.
    MoveCompleted {
        /// Absolute target in steps
        target: i64,
    },
    /// A move was never acknowledged; pending moves were dropped.
    MoveTimedOut {
        /// Target of the unacknowledged move
        target: i64,
        /// Pending moves discarded with it
        dropped: usize,
    },
    /// A stop was issued; `dropped` pending moves were discarded.
    Stopped {
        /// Pending moves discarded
        dropped: usize,
    },
    /// The device confirmed an EEPROM save.
    SaveConfirmed,
    /// No `SAVED` arrived before the save timeout.
    SaveUnconfirmed,
    /// The session was closed deliberately.
    Closed,
    /// The link was lost.
    Disconnected {
        /// Error that ended the link
        reason: String,
    },
}

/// Result of a move request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    /// The (possibly clamped) target was queued.
    Queued {
        /// Absolute target in steps
        target: i64,
        /// Whether the request was pulled back into travel range
        clamped: bool,
    },
    /// The request pointed past a bound the stage already sits at.
    LimitReached {
        /// Current position in steps
        position: i64,
    },
    /// The request equals the current position.
    AlreadyAtTarget {
        /// Current position in steps
        position: i64,
    },
}

/// Result of an EEPROM save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// `SAVED` was received.
    Confirmed,
    /// No confirmation within the timeout. The save may still have happened.
    Unconfirmed,
}

/// Point-in-time view of the session for display.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    /// Connection and motion state
    pub state: SessionState,
    /// Displayed position in steps
    pub position_steps: i64,
    /// Displayed position in mm
    pub position_mm: f64,
    /// Travel length in mm
    pub max_range_mm: f64,
    /// Moves queued but not yet sent.
    pub pending: usize,
    /// Target of the move awaiting `OK`, if any.
    pub in_flight: Option<i64>,
    /// Transport description (port path or `simulated`)
    pub port: String,
}

/// One connection to the stage controller.
pub struct Session<T: Transport> {
    transport: T,
    port: String,
    connected: bool,
    position: PositionModel,
    dispatcher: Dispatcher,
    settings: SessionSettings,
    events: UnboundedSender<SessionEvent>,
}

impl<T: Transport> Session<T> {
    /// Start a session on an already-open transport.
    ///
    /// The optimistic position starts at the model's current value (normally
    /// 0); call [`load_position`](Self::load_position) to adopt the value the
    /// device saved last time.
    pub fn new(
        transport: T,
        position: PositionModel,
        settings: SessionSettings,
    ) -> (Self, SessionEvents) {
        let (events, rx) = mpsc::unbounded_channel();
        let port = transport.describe();
        let connected = transport.is_open();

        info!(port = %port, connected, "Session started");

        let session = Self {
            transport,
            port,
            connected,
            position,
            dispatcher: Dispatcher::new(settings.move_timeout),
            settings,
            events,
        };
        (session, rx)
    }

    /// Start a session with geometry and timing from configuration.
    pub fn from_config(transport: T, config: &StageConfig) -> (Self, SessionEvents) {
        Self::new(
            transport,
            config.stage.position_model(),
            SessionSettings::from(&config.timing),
        )
    }

    // =========================================================================
    // Status
    // =========================================================================

    /// Whether commands can still be sent.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Whether a move awaits `OK`.
    pub fn is_busy(&self) -> bool {
        self.dispatcher.is_busy()
    }

    /// Current [`SessionState`].
    pub fn state(&self) -> SessionState {
        if !self.connected {
            SessionState::Disconnected
        } else if self.dispatcher.is_busy() {
            SessionState::Busy
        } else {
            SessionState::Idle
        }
    }

    /// Optimistic position in steps.
    pub fn position_steps(&self) -> i64 {
        self.position.current()
    }

    /// Optimistic position in millimetres.
    pub fn position_mm(&self) -> f64 {
        self.position.current_mm()
    }

    /// Number of moves queued but not yet sent.
    pub fn pending_len(&self) -> usize {
        self.dispatcher.pending_len()
    }

    /// Geometry and bounds in use.
    pub fn position_model(&self) -> &PositionModel {
        &self.position
    }

    /// Borrow the transport (e.g. to inspect a simulated device).
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Snapshot for display.
    pub fn status(&self) -> StatusSnapshot {
        let (_, max_steps) = self.position.bounds();
        StatusSnapshot {
            state: self.state(),
            position_steps: self.position.current(),
            position_mm: self.position.current_mm(),
            max_range_mm: self.position.scale().steps_to_mm(max_steps),
            pending: self.dispatcher.pending_len(),
            in_flight: self.dispatcher.in_flight().map(|f| f.target),
            port: self.port.clone(),
        }
    }

    // =========================================================================
    // Motion
    // =========================================================================

    /// Queue a move by `delta_mm` relative to the optimistic position.
    #[instrument(skip(self), fields(port = %self.port), err)]
    pub fn move_relative(&mut self, delta_mm: f64) -> StageResult<MoveOutcome> {
        self.ensure_connected()?;
        let delta_steps = self.position.scale().mm_to_steps(delta_mm);
        let plan = self.position.plan_relative(delta_steps);
        Ok(self.submit(plan))
    }

    /// Queue a move to an absolute position in millimetres.
    #[instrument(skip(self), fields(port = %self.port), err)]
    pub fn move_absolute(&mut self, target_mm: f64) -> StageResult<MoveOutcome> {
        self.ensure_connected()?;
        let requested = self.position.scale().mm_to_steps(target_mm);
        let plan = self.position.plan_absolute(requested);
        Ok(self.submit(plan))
    }

    fn submit(&mut self, plan: MovePlan) -> MoveOutcome {
        let current = self.position.current();

        if self.position.is_noop(&plan) {
            if plan.clamped() {
                info!(position = current, requested = plan.requested, "Limit reached");
                self.emit(SessionEvent::LimitReached { steps: current });
                return MoveOutcome::LimitReached { position: current };
            }
            debug!(position = current, "Already at target");
            return MoveOutcome::AlreadyAtTarget { position: current };
        }

        if plan.clamped() {
            warn!(
                requested = plan.requested,
                target_steps = plan.target,
                "Target outside travel range, clamped"
            );
        }

        self.position.set_current(plan.target);
        self.emit_position(PositionSource::Optimistic);
        self.dispatcher.enqueue_absolute(plan.target);
        debug!(
            target_steps = plan.target,
            pending = self.dispatcher.pending_len(),
            "Move queued"
        );

        MoveOutcome::Queued {
            target: plan.target,
            clamped: plan.clamped(),
        }
    }

    /// Send the next queued move if the device is idle.
    ///
    /// Applies the move-timeout policy first. Returns the dispatched target.
    /// While disconnected this does nothing and pending moves stay queued.
    pub fn pump(&mut self) -> StageResult<Option<i64>> {
        if !self.connected {
            return Ok(None);
        }

        let now = Instant::now();
        if let Some(timeout) = self.dispatcher.check_timeout(now) {
            warn!(
                target_steps = timeout.target,
                dropped = timeout.dropped,
                "No acknowledgment for move, abandoning it and pending moves"
            );
            self.emit(SessionEvent::MoveTimedOut {
                target: timeout.target,
                dropped: timeout.dropped,
            });
            self.enable_controls();
        }

        let Some(target) = self.dispatcher.pump(now) else {
            return Ok(None);
        };

        if let Err(err) = self.write_command(Command::MoveAbsolute(target)) {
            self.dispatcher.requeue_front();
            return Err(self.transport_failure(err));
        }

        self.emit(SessionEvent::ControlsEnabled(false));
        self.emit(SessionEvent::MoveDispatched { target });
        Ok(Some(target))
    }

    /// Abort motion: drop the queue, send `S` regardless of busy state.
    ///
    /// Local queue/busy state is cleared even when the link is down.
    /// Returns the number of pending moves dropped.
    #[instrument(skip(self), fields(port = %self.port), err)]
    pub fn stop(&mut self) -> StageResult<usize> {
        let dropped = self.dispatcher.stop();
        info!(dropped, "Stop requested");
        self.emit(SessionEvent::Stopped { dropped });

        self.ensure_connected()?;
        let sent = self.send(Command::Stop);
        self.enable_controls();
        sent.map(|()| dropped)
    }

    // =========================================================================
    // Position memory
    // =========================================================================

    /// Ask the device to persist its position and wait for `SAVED`.
    ///
    /// Blocks for at most the configured save timeout. Unread input is
    /// flushed first; `OK` and `POS:` lines found while flushing or waiting
    /// are still applied (busy cleared, position overwritten) but the queue is
    /// not pumped until the next [`pump`](Self::pump).
    #[instrument(skip(self), fields(port = %self.port), err)]
    pub fn save_position(&mut self) -> StageResult<SaveOutcome> {
        self.ensure_connected()?;

        self.drain_pending()?;
        match self.transport.discard_input() {
            Ok(0) => {}
            Ok(n) => debug!(bytes = n, "Discarded stale input"),
            Err(err) => return Err(self.transport_failure(err.into())),
        }

        info!("Saving position to device EEPROM");
        self.send(Command::SavePosition)?;

        let timeout = self.settings.save_timeout;
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }

            match self.transport.read_line() {
                Ok(Some(line)) => {
                    let response = decode(&line);
                    if response == Response::Saved {
                        info!("Position saved to device EEPROM");
                        self.emit(SessionEvent::SaveConfirmed);
                        return Ok(SaveOutcome::Confirmed);
                    }
                    self.apply_response(response, &line);
                }
                Ok(None) => {
                    let remaining = deadline.saturating_duration_since(now);
                    std::thread::sleep(self.settings.poll_interval.min(remaining));
                }
                Err(err) => return Err(self.transport_failure(err.into())),
            }
        }

        warn!(timeout_ms = timeout.as_millis() as u64, "No save confirmation received");
        self.emit(SessionEvent::SaveUnconfirmed);
        Ok(SaveOutcome::Unconfirmed)
    }

    /// Request the saved position; the `POS:` reply arrives via
    /// [`poll_incoming`](Self::poll_incoming).
    #[instrument(skip(self), fields(port = %self.port), err)]
    pub fn load_position(&mut self) -> StageResult<()> {
        self.ensure_connected()?;
        info!("Requesting saved position from device EEPROM");
        self.send(Command::LoadPosition)
    }

    /// Declare the stage to be at `new_mm` without moving it.
    ///
    /// The value is clamped to the travel range. The device counter is updated
    /// with `C<n>` and the queue is cleared without sending `S`. Returns the
    /// calibrated position in steps.
    #[instrument(skip(self), fields(port = %self.port), err)]
    pub fn calibrate(&mut self, new_mm: f64) -> StageResult<i64> {
        self.ensure_connected()?;

        let requested = self.position.scale().mm_to_steps(new_mm);
        let steps = self.position.clamp_target(requested);
        if steps != requested {
            warn!(requested, steps, "Calibration value outside travel range, clamped");
        }

        info!(mm = new_mm, steps, "Calibrating position");
        self.position.set_current(steps);
        self.emit_position(PositionSource::Calibration);

        let sent = self.send(Command::Calibrate(steps));
        let dropped = self.dispatcher.clear_and_reset();
        if dropped > 0 {
            debug!(dropped, "Calibration cleared pending moves");
        }
        self.enable_controls();

        sent.map(|()| steps)
    }

    // =========================================================================
    // Receive loop
    // =========================================================================

    /// Read and route at most one incoming line.
    ///
    /// `OK` retires the in-flight move and immediately pumps the next one.
    /// A lost link marks the session disconnected and returns `Ok(None)`.
    pub fn poll_incoming(&mut self) -> StageResult<Option<Response>> {
        if !self.connected {
            return Ok(None);
        }

        let line = match self.transport.read_line() {
            Ok(Some(line)) => line,
            Ok(None) => return Ok(None),
            Err(err) => {
                let err = StageError::from(err);
                if err.is_link_loss() {
                    self.mark_disconnected(&err.to_string());
                    return Ok(None);
                }
                return Err(err);
            }
        };

        let response = decode(&line);
        self.apply_response(response, &line);
        if response == Response::Ack {
            self.pump()?;
        }
        Ok(Some(response))
    }

    /// One host-loop iteration: `poll_incoming()` then `pump()`.
    pub fn tick(&mut self) -> StageResult<()> {
        self.poll_incoming()?;
        self.pump()?;
        Ok(())
    }

    fn drain_pending(&mut self) -> StageResult<()> {
        loop {
            match self.transport.read_line() {
                Ok(Some(line)) => {
                    let response = decode(&line);
                    self.apply_response(response, &line);
                }
                Ok(None) => return Ok(()),
                Err(err) => return Err(self.transport_failure(err.into())),
            }
        }
    }

    fn apply_response(&mut self, response: Response, line: &[u8]) {
        match response {
            Response::Ack => match self.dispatcher.on_ack() {
                Some(flight) => {
                    debug!(target_steps = flight.target, "Move acknowledged");
                    self.emit(SessionEvent::MoveCompleted {
                        target: flight.target,
                    });
                    self.enable_controls();
                }
                None => debug!("Ignoring OK with no move in flight"),
            },
            Response::PositionReport(steps) => {
                if !self.position.contains(steps) {
                    warn!(steps, "Device reported a position outside the travel range");
                }
                info!(steps, "Position loaded from device");
                self.position.set_current(steps);
                self.emit_position(PositionSource::Device);
            }
            // Only the wait in save_position() may confirm a save.
            Response::Saved => debug!("Ignoring SAVED outside a save request"),
            Response::Unrecognized => {
                trace!(line = %String::from_utf8_lossy(line), "Discarding unrecognized line");
            }
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Best-effort save, then close the link.
    ///
    /// Meant for shutdown/sleep hooks: never blocks longer than the save
    /// timeout and never fails because the save failed. Calling it on a closed
    /// session is a no-op.
    #[instrument(skip(self), fields(port = %self.port))]
    pub fn flush_and_close(&mut self) -> StageResult<()> {
        if self.connected {
            match self.save_position() {
                Ok(SaveOutcome::Confirmed) => {}
                Ok(SaveOutcome::Unconfirmed) => {
                    warn!("Closing without save confirmation");
                }
                Err(err) => warn!(error = %err, "Position flush failed"),
            }
        }
        self.close()
    }

    /// Close the link without saving.
    pub fn close(&mut self) -> StageResult<()> {
        if self.go_offline() {
            info!(port = %self.port, "Session closed");
            self.emit(SessionEvent::Closed);
        }
        if self.transport.is_open() {
            self.transport.close()?;
        }
        Ok(())
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn ensure_connected(&self) -> StageResult<()> {
        if self.connected {
            Ok(())
        } else {
            Err(StageError::NotConnected)
        }
    }

    fn write_command(&mut self, command: Command) -> StageResult<()> {
        if !self.connected {
            return Err(StageError::NotConnected);
        }
        debug!(%command, "Sending command");
        self.transport.write_all(&encode(&command))?;
        Ok(())
    }

    fn send(&mut self, command: Command) -> StageResult<()> {
        self.write_command(command)
            .map_err(|err| self.transport_failure(err))
    }

    fn transport_failure(&mut self, err: StageError) -> StageError {
        if err.is_link_loss() {
            self.mark_disconnected(&err.to_string());
        }
        err
    }

    /// Leave the connected state. Returns `false` if already offline.
    fn go_offline(&mut self) -> bool {
        if !self.connected {
            return false;
        }
        self.connected = false;
        if let Some(flight) = self.dispatcher.reset_busy() {
            debug!(target_steps = flight.target, "In-flight move abandoned");
        }
        self.emit(SessionEvent::ControlsEnabled(false));
        true
    }

    fn mark_disconnected(&mut self, reason: &str) {
        if self.go_offline() {
            warn!(
                port = %self.port,
                reason,
                pending = self.dispatcher.pending_len(),
                "Link to stage lost"
            );
            self.emit(SessionEvent::Disconnected {
                reason: reason.to_string(),
            });
        }
    }

    /// Re-enable movement controls, unless the link is gone.
    fn enable_controls(&self) {
        if self.connected {
            self.emit(SessionEvent::ControlsEnabled(true));
        }
    }

    fn emit_position(&self, source: PositionSource) {
        self.emit(SessionEvent::PositionChanged {
            steps: self.position.current(),
            mm: self.position.current_mm(),
            source,
        });
    }

    fn emit(&self, event: SessionEvent) {
        // A front end that stopped listening is not an error.
        let _ = self.events.send(event);
    }
}
