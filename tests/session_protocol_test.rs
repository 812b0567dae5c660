//! Protocol-level integration tests for the session controller
//!
//! A `MockDeviceHarness` plays the device: it observes every line the session
//! writes and injects responses, so these tests pin down the exact wire
//! traffic for each user operation.

use stage_control::position::{PositionModel, StepScale};
use stage_control::protocol::{decode, encode, encode_response, Command, Response};
use stage_control::session::{
    MoveOutcome, PositionSource, SaveOutcome, Session, SessionEvent, SessionEvents,
    SessionSettings, SessionState,
};
use stage_control::transport::mock::{self, MockDeviceHarness, MockTransport};
use stage_control::StageError;
use std::time::{Duration, Instant};
use tracing_test::traced_test;

fn open_session(save_timeout: Duration) -> (Session<MockTransport>, SessionEvents, MockDeviceHarness) {
    let (port, harness) = mock::new();
    let model = PositionModel::new(StepScale::from_geometry(1600, 0.5), 50.0);
    let settings = SessionSettings {
        save_timeout,
        poll_interval: Duration::from_millis(5),
        move_timeout: None,
    };
    let (session, events) = Session::new(port, model, settings);
    (session, events, harness)
}

fn collect(events: &mut SessionEvents) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

// =============================================================================
// Ordering and single-in-flight
// =============================================================================

#[test]
fn test_moves_are_sent_in_order_one_per_ack() {
    let (mut session, _events, mut harness) = open_session(Duration::from_millis(50));

    for mm in [1.0, 2.0, 3.0, 2.5] {
        session.move_absolute(mm).unwrap();
    }
    assert_eq!(session.pending_len(), 4);

    let mut sent = Vec::new();
    session.pump().unwrap();
    for _ in 0..4 {
        // However often the host loop pumps, only one move is outstanding.
        for _ in 0..3 {
            session.pump().unwrap();
        }
        let written = harness.take_commands();
        assert_eq!(written.len(), 1, "expected one command, got {written:?}");
        sent.extend(written);

        harness.send_line("OK");
        session.poll_incoming().unwrap();
    }

    assert_eq!(
        sent,
        vec![
            Command::MoveAbsolute(3200),
            Command::MoveAbsolute(6400),
            Command::MoveAbsolute(9600),
            Command::MoveAbsolute(8000),
        ]
    );
    assert_eq!(session.state(), SessionState::Idle);
    harness.expect_silence();
}

#[test]
fn test_relative_moves_accumulate_from_optimistic_position() {
    let (mut session, _events, mut harness) = open_session(Duration::from_millis(50));

    // Queued back to back, before any acknowledgment arrives.
    session.move_relative(1.0).unwrap();
    session.move_relative(1.0).unwrap();
    session.move_relative(-0.5).unwrap();
    assert_eq!(session.position_steps(), 4800);

    session.tick().unwrap();
    harness.expect_line("M3200");
    harness.send_line("OK");
    session.tick().unwrap();
    harness.expect_line("M6400");
    harness.send_line("OK");
    session.tick().unwrap();
    harness.expect_line("M4800");
}

#[test]
fn test_controls_follow_busy_flag() {
    let (mut session, mut events, harness) = open_session(Duration::from_millis(50));

    session.move_absolute(1.0).unwrap();
    session.pump().unwrap();
    harness.send_line("OK");
    session.poll_incoming().unwrap();

    let controls: Vec<bool> = collect(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            SessionEvent::ControlsEnabled(enabled) => Some(enabled),
            _ => None,
        })
        .collect();
    assert_eq!(controls, vec![false, true]);
}

// =============================================================================
// Clamping
// =============================================================================

#[test]
fn test_repeated_moves_past_limit_send_nothing() {
    let (mut session, mut events, mut harness) = open_session(Duration::from_millis(50));

    for _ in 0..5 {
        let outcome = session.move_relative(-1.0).unwrap();
        assert_eq!(outcome, MoveOutcome::LimitReached { position: 0 });
    }
    session.pump().unwrap();
    harness.expect_silence();
    assert_eq!(session.pending_len(), 0);
    assert!(!session.is_busy());

    let limits = collect(&mut events)
        .into_iter()
        .filter(|e| matches!(e, SessionEvent::LimitReached { steps: 0 }))
        .count();
    assert_eq!(limits, 5);
}

#[test]
fn test_move_beyond_far_end_is_clamped_once() {
    let (mut session, _events, mut harness) = open_session(Duration::from_millis(50));

    assert_eq!(
        session.move_absolute(49.0).unwrap(),
        MoveOutcome::Queued {
            target: 156_800,
            clamped: false
        }
    );
    assert_eq!(
        session.move_relative(5.0).unwrap(),
        MoveOutcome::Queued {
            target: 160_000,
            clamped: true
        }
    );
    assert_eq!(
        session.move_relative(5.0).unwrap(),
        MoveOutcome::LimitReached { position: 160_000 }
    );

    session.pump().unwrap();
    harness.send_line("OK");
    session.poll_incoming().unwrap();
    assert_eq!(
        harness.take_written(),
        vec!["M156800".to_string(), "M160000".to_string()]
    );
}

#[test]
fn test_fractional_steps_truncate_toward_zero() {
    let (mut session, _events, _harness) = open_session(Duration::from_millis(50));
    session.move_absolute(10.0).unwrap();

    // 0.0004 mm is 1.28 steps.
    session.move_relative(0.0004).unwrap();
    assert_eq!(session.position_steps(), 32_001);
    session.move_relative(-0.0004).unwrap();
    assert_eq!(session.position_steps(), 32_000);
}

// =============================================================================
// Stop and calibration
// =============================================================================

#[test]
fn test_stop_discards_queue_and_sends_s() {
    let (mut session, _events, mut harness) = open_session(Duration::from_millis(50));
    for mm in [5.0, 10.0, 15.0] {
        session.move_absolute(mm).unwrap();
    }
    session.pump().unwrap();
    harness.expect_line("M16000");

    assert_eq!(session.stop().unwrap(), 2);
    harness.expect_line("S");

    // The late OK from the aborted move is harmless.
    harness.send_line("OK");
    session.tick().unwrap();
    harness.expect_silence();
    assert_eq!(session.state(), SessionState::Idle);
}

#[test]
fn test_stop_while_idle_still_sends_s() {
    let (mut session, _events, mut harness) = open_session(Duration::from_millis(50));
    assert_eq!(session.stop().unwrap(), 0);
    harness.expect_line("S");
}

#[test]
fn test_calibrate_then_move_uses_new_origin() {
    let (mut session, _events, mut harness) = open_session(Duration::from_millis(50));

    session.calibrate(25.0).unwrap();
    harness.expect_line("C80000");

    session.move_relative(1.0).unwrap();
    session.pump().unwrap();
    harness.expect_line("M83200");
}

// =============================================================================
// Authoritative position reports
// =============================================================================

#[test]
fn test_position_report_overrides_optimistic_value() {
    let (mut session, mut events, mut harness) = open_session(Duration::from_millis(50));

    session.move_absolute(10.0).unwrap();
    assert_eq!(session.position_steps(), 32_000);

    session.load_position().unwrap();
    harness.expect_line("L");
    harness.send_line("POS:12345");
    session.poll_incoming().unwrap();

    assert_eq!(session.position_steps(), 12_345);
    assert!(collect(&mut events).iter().any(|e| matches!(
        e,
        SessionEvent::PositionChanged {
            steps: 12_345,
            source: PositionSource::Device,
            ..
        }
    )));

    // Relative moves now plan from the reported value.
    session.move_relative(1.0).unwrap();
    assert_eq!(session.position_steps(), 15_545);
}

#[test]
fn test_out_of_range_report_is_stored_as_reported() {
    let (mut session, _events, harness) = open_session(Duration::from_millis(50));
    harness.send_line("POS:-42");
    session.poll_incoming().unwrap();
    assert_eq!(session.position_steps(), -42);

    // The next move is clamped back into range.
    let outcome = session.move_relative(0.001).unwrap();
    assert_eq!(
        outcome,
        MoveOutcome::Queued {
            target: 0,
            clamped: true
        }
    );
}

#[test]
fn test_noise_on_the_line_is_ignored() {
    let (mut session, _events, mut harness) = open_session(Duration::from_millis(50));
    session.move_absolute(1.0).unwrap();
    session.pump().unwrap();
    harness.take_written();

    harness.send_line("Stepper ready");
    harness.send_line("");
    harness.send_line("OKAY");
    harness.send_raw(b"\r\n");
    for _ in 0..4 {
        session.poll_incoming().unwrap();
    }
    assert!(session.is_busy());
    assert!(session.is_connected());

    harness.send_line("OK\r");
    session.poll_incoming().unwrap();
    assert!(!session.is_busy());
}

// =============================================================================
// Save / load
// =============================================================================

#[test]
#[traced_test]
fn test_save_without_confirmation_returns_within_timeout() {
    let (mut session, mut events, mut harness) = open_session(Duration::from_millis(150));

    let start = Instant::now();
    let outcome = session.save_position().unwrap();
    let elapsed = start.elapsed();

    assert_eq!(outcome, SaveOutcome::Unconfirmed);
    assert!(elapsed >= Duration::from_millis(150));
    assert!(elapsed < Duration::from_millis(1500), "took {elapsed:?}");
    harness.expect_line("P");
    assert!(collect(&mut events).contains(&SessionEvent::SaveUnconfirmed));
    assert!(logs_contain("No save confirmation received"));
}

#[test]
fn test_save_discards_stale_saved_line() {
    let (mut session, _events, mut harness) = open_session(Duration::from_millis(80));

    // A SAVED left over from an earlier save must not confirm this one.
    harness.send_line("SAVED");
    assert_eq!(session.save_position().unwrap(), SaveOutcome::Unconfirmed);
    harness.expect_line("P");
}

#[test]
fn test_save_confirmation_from_device_thread() {
    let (mut session, mut events, harness) = open_session(Duration::from_secs(2));

    let device = std::thread::spawn(move || {
        let mut harness = harness;
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if harness.take_commands().contains(&Command::SavePosition) {
                harness.send_line("SAVED");
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        harness
    });

    let start = Instant::now();
    assert_eq!(session.save_position().unwrap(), SaveOutcome::Confirmed);
    assert!(start.elapsed() < Duration::from_secs(2));
    assert!(collect(&mut events).contains(&SessionEvent::SaveConfirmed));
    let _harness = device.join().unwrap();
}

// =============================================================================
// Disconnect
// =============================================================================

#[test]
fn test_disconnect_mid_move_is_terminal() {
    let (mut session, mut events, mut harness) = open_session(Duration::from_millis(50));
    session.move_absolute(1.0).unwrap();
    session.move_absolute(2.0).unwrap();
    session.pump().unwrap();
    harness.take_written();
    harness.disconnect();

    session.tick().unwrap();
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(!session.is_busy());
    assert_eq!(session.pending_len(), 1);
    assert!(collect(&mut events)
        .iter()
        .any(|e| matches!(e, SessionEvent::Disconnected { .. })));

    assert!(matches!(
        session.save_position(),
        Err(StageError::NotConnected)
    ));
    assert!(matches!(session.calibrate(1.0), Err(StageError::NotConnected)));

    // Shutdown still succeeds.
    session.flush_and_close().unwrap();
}

// =============================================================================
// Codec
// =============================================================================

#[test]
fn test_codec_round_trip_for_extreme_values() {
    for n in [0, 1, -1, 160_000, i64::MAX, i64::MIN] {
        for command in [Command::MoveAbsolute(n), Command::Calibrate(n)] {
            let bytes = encode(&command);
            assert_eq!(bytes.last(), Some(&b'\n'));
            assert_eq!(Command::parse(&bytes[..bytes.len() - 1]), Some(command));
        }

        let line = encode_response(&Response::PositionReport(n)).unwrap();
        assert_eq!(decode(&line), Response::PositionReport(n));
    }
}
