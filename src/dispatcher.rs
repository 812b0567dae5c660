//! Single-in-flight command queue.
//!
//! The dispatcher owns the FIFO of not-yet-sent absolute targets and the busy
//! flag. It never touches the transport: [`Dispatcher::pump`] hands back the
//! target that must be written, and the session performs the write. This keeps
//! the in-flight discipline testable without any I/O.
//!
//! # Invariants
//!
//! - At most one move is in flight. `pump` is the only transition from idle
//!   to busy and refuses to dispatch while busy.
//! - Targets leave the queue in insertion order; nothing is merged or dropped
//!   except by [`Dispatcher::stop`], [`Dispatcher::clear_and_reset`] or the
//!   move-timeout policy.
//! - Busy/idle transitions are reported by the session as
//!   `SessionEvent::ControlsEnabled` so a front end can grey out movement
//!   controls while the actuator is working.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// A move that has been sent and is awaiting `OK`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InFlight {
    /// Target of the outstanding move, in steps.
    pub target: i64,
    /// When the move was dispatched.
    pub sent_at: Instant,
}

/// A move whose acknowledgment never arrived within the timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveTimeout {
    /// Target of the abandoned move.
    pub target: i64,
    /// Pending targets discarded with it.
    pub dropped: usize,
}

/// FIFO queue of absolute targets gated by a busy flag.
#[derive(Debug, Default)]
pub struct Dispatcher {
    pending: VecDeque<i64>,
    in_flight: Option<InFlight>,
    move_timeout: Option<Duration>,
}

impl Dispatcher {
    /// Create an idle dispatcher.
    ///
    /// `move_timeout` of `None` waits forever for `OK`.
    pub fn new(move_timeout: Option<Duration>) -> Self {
        Self {
            pending: VecDeque::new(),
            in_flight: None,
            move_timeout,
        }
    }

    /// Whether a move is in flight.
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// The move awaiting `OK`, if any.
    pub fn in_flight(&self) -> Option<InFlight> {
        self.in_flight
    }

    /// Number of targets waiting to be sent.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Snapshot of the waiting targets, front first.
    pub fn pending(&self) -> impl Iterator<Item = i64> + '_ {
        self.pending.iter().copied()
    }

    /// Append a target. Nothing is sent.
    pub fn enqueue_absolute(&mut self, target_steps: i64) {
        self.pending.push_back(target_steps);
    }

    /// Pop the next target and mark it in flight.
    ///
    /// Returns `None` while busy or when the queue is empty. On `Some`, the
    /// caller must send `MoveAbsolute(target)` and disable movement controls.
    pub fn pump(&mut self, now: Instant) -> Option<i64> {
        if self.in_flight.is_some() {
            return None;
        }
        let target = self.pending.pop_front()?;
        self.in_flight = Some(InFlight {
            target,
            sent_at: now,
        });
        Some(target)
    }

    /// Undo a `pump` whose write failed: the target goes back to the front.
    pub fn requeue_front(&mut self) {
        if let Some(flight) = self.in_flight.take() {
            self.pending.push_front(flight.target);
        }
    }

    /// The device acknowledged the in-flight move.
    ///
    /// Returns the retired move, or `None` for a stray `OK` received while idle
    /// (e.g. the tail end of a stopped move).
    pub fn on_ack(&mut self) -> Option<InFlight> {
        self.in_flight.take()
    }

    /// Drop all pending targets and force idle. Returns the number dropped.
    ///
    /// Used for `Stop`, which the session sends regardless of busy state.
    pub fn stop(&mut self) -> usize {
        self.clear_and_reset()
    }

    /// Drop all pending targets and force idle without any device traffic.
    pub fn clear_and_reset(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        self.in_flight = None;
        dropped
    }

    /// Force idle after link loss. Pending targets stay queued.
    pub fn reset_busy(&mut self) -> Option<InFlight> {
        self.in_flight.take()
    }

    /// Apply the move-timeout policy.
    ///
    /// A move outstanding for longer than the timeout is treated as lost: busy
    /// is cleared and the remaining queue (planned from an unconfirmed
    /// position) is dropped.
    pub fn check_timeout(&mut self, now: Instant) -> Option<MoveTimeout> {
        let limit = self.move_timeout?;
        let flight = self.in_flight?;
        if now.saturating_duration_since(flight.sent_at) < limit {
            return None;
        }

        self.in_flight = None;
        let dropped = self.pending.len();
        self.pending.clear();
        Some(MoveTimeout {
            target: flight.target,
            dropped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pump_dispatches_in_fifo_order_one_at_a_time() {
        let now = Instant::now();
        let mut d = Dispatcher::new(None);
        d.enqueue_absolute(10);
        d.enqueue_absolute(20);
        d.enqueue_absolute(30);

        assert_eq!(d.pump(now), Some(10));
        assert!(d.is_busy());
        // Busy: nothing else leaves the queue.
        assert_eq!(d.pump(now), None);
        assert_eq!(d.pending_len(), 2);

        assert_eq!(d.on_ack().map(|f| f.target), Some(10));
        assert_eq!(d.pump(now), Some(20));
        d.on_ack();
        assert_eq!(d.pump(now), Some(30));
        d.on_ack();
        assert_eq!(d.pump(now), None);
        assert!(!d.is_busy());
    }

    #[test]
    fn duplicates_are_not_coalesced() {
        let now = Instant::now();
        let mut d = Dispatcher::new(None);
        d.enqueue_absolute(5);
        d.enqueue_absolute(5);
        assert_eq!(d.pending().collect::<Vec<_>>(), vec![5, 5]);
        assert_eq!(d.pump(now), Some(5));
        d.on_ack();
        assert_eq!(d.pump(now), Some(5));
    }

    #[test]
    fn stray_ack_while_idle_is_harmless() {
        let mut d = Dispatcher::new(None);
        assert!(d.on_ack().is_none());
        assert!(!d.is_busy());
    }

    #[test]
    fn stop_clears_queue_and_busy() {
        let now = Instant::now();
        let mut d = Dispatcher::new(None);
        for t in [1, 2, 3] {
            d.enqueue_absolute(t);
        }
        d.pump(now);
        assert_eq!(d.stop(), 2);
        assert_eq!(d.pending_len(), 0);
        assert!(!d.is_busy());
    }

    #[test]
    fn requeue_front_restores_failed_dispatch() {
        let now = Instant::now();
        let mut d = Dispatcher::new(None);
        d.enqueue_absolute(1);
        d.enqueue_absolute(2);
        assert_eq!(d.pump(now), Some(1));
        d.requeue_front();
        assert!(!d.is_busy());
        assert_eq!(d.pending().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn reset_busy_keeps_pending_targets() {
        let now = Instant::now();
        let mut d = Dispatcher::new(None);
        d.enqueue_absolute(1);
        d.enqueue_absolute(2);
        d.pump(now);
        assert_eq!(d.reset_busy().map(|f| f.target), Some(1));
        assert_eq!(d.pending_len(), 1);
    }

    #[test]
    fn timeout_abandons_move_and_drops_queue() {
        let start = Instant::now();
        let mut d = Dispatcher::new(Some(Duration::from_secs(5)));
        d.enqueue_absolute(100);
        d.enqueue_absolute(200);
        d.pump(start);

        assert_eq!(d.check_timeout(start + Duration::from_secs(4)), None);
        assert!(d.is_busy());

        let timeout = d.check_timeout(start + Duration::from_secs(5));
        assert_eq!(
            timeout,
            Some(MoveTimeout {
                target: 100,
                dropped: 1
            })
        );
        assert!(!d.is_busy());
        assert_eq!(d.pending_len(), 0);
    }

    #[test]
    fn disabled_timeout_never_fires() {
        let start = Instant::now();
        let mut d = Dispatcher::new(None);
        d.enqueue_absolute(1);
        d.pump(start);
        assert_eq!(d.check_timeout(start + Duration::from_secs(3600)), None);
        assert!(d.is_busy());
    }
}
