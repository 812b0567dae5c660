//! Text control panel.
//!
//! The binary's front end: one command per stdin line, applied to a
//! [`Session`], plus the status readout (position in mm and a travel bar).
//!
//! | Input | Action |
//! |---|---|
//! | `left [mm]` / `<` | relative move by `-mm` (default: jog step) |
//! | `right [mm]` / `>` | relative move by `+mm` |
//! | `step <mm>` | set the jog step |
//! | `goto <mm>` | absolute move |
//! | `stop` | abort motion and drop the queue |
//! | `save` / `load` | EEPROM position memory |
//! | `cal <mm>` | declare the current position |
//! | `status` | print the readout |
//! | `help` / `quit` | |

use crate::error::StageResult;
use crate::session::{
    MoveOutcome, PositionSource, SaveOutcome, Session, SessionEvent, SessionState,
    StatusSnapshot,
};
use crate::transport::Transport;
use std::fmt::Write as _;
use thiserror::Error;

/// Jog step used until the user sets one.
pub const DEFAULT_JOG_MM: f64 = 1.0;

/// Width of the travel bar in characters, excluding brackets.
pub const BAR_WIDTH: usize = 30;

/// Text printed by `help`.
pub const HELP: &str = "\
Commands:
  left [mm]   | <     move left by mm (default: jog step)
  right [mm]  | >     move right by mm
  step <mm>           set jog step
  goto <mm>           move to absolute position
  stop                stop motion and clear queue
  save                save position to device
  load                load position from device
  cal <mm>            calibrate: current position is <mm>
  status              show position
  help                show this text
  quit                save position and exit";

/// A parsed console line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConsoleCommand {
    /// Jog toward zero, by the given mm or the jog step
    Left(Option<f64>),
    /// Jog away from zero, by the given mm or the jog step
    Right(Option<f64>),
    /// Change the jog step
    SetStep(f64),
    /// Move to an absolute position in mm
    Goto(f64),
    /// Stop
    Stop,
    /// Save position to EEPROM
    Save,
    /// Load position from EEPROM
    Load,
    /// Declare the current position in mm
    Calibrate(f64),
    /// Show position and queue
    Status,
    /// Show [`HELP`]
    Help,
    /// Save and exit
    Quit,
}

/// Why a console line was rejected.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    /// First word is not a command
    #[error("Unknown command '{0}' (type 'help')")]
    Unknown(String),

    /// Command requires a distance and none was given
    #[error("'{0}' needs a distance in mm")]
    MissingArgument(&'static str),

    /// Argument is not a finite number
    #[error("Not a number: '{0}'")]
    InvalidNumber(String),

    /// Extra words after the argument
    #[error("Unexpected input after command: '{0}'")]
    TrailingInput(String),
}

impl ConsoleCommand {
    /// Parse one input line. Blank lines yield `Ok(None)`.
    pub fn parse(line: &str) -> Result<Option<Self>, ParseError> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };
        let arg = words.next();
        if let Some(extra) = words.next() {
            return Err(ParseError::TrailingInput(extra.to_string()));
        }

        let command = match verb.to_ascii_lowercase().as_str() {
            "left" | "<" => Self::Left(arg.map(parse_mm).transpose()?),
            "right" | ">" => Self::Right(arg.map(parse_mm).transpose()?),
            "step" => Self::SetStep(required(arg, "step")?),
            "goto" | "go" => Self::Goto(required(arg, "goto")?),
            "cal" | "calibrate" => Self::Calibrate(required(arg, "cal")?),
            other => {
                if let Some(arg) = arg {
                    return Err(ParseError::TrailingInput(arg.to_string()));
                }
                match other {
                    "stop" | "s" => Self::Stop,
                    "save" => Self::Save,
                    "load" => Self::Load,
                    "status" | "pos" => Self::Status,
                    "help" | "?" => Self::Help,
                    "quit" | "exit" | "q" => Self::Quit,
                    _ => return Err(ParseError::Unknown(verb.to_string())),
                }
            }
        };
        Ok(Some(command))
    }
}

fn parse_mm(text: &str) -> Result<f64, ParseError> {
    text.parse::<f64>()
        .ok()
        .filter(|mm| mm.is_finite())
        .ok_or_else(|| ParseError::InvalidNumber(text.to_string()))
}

fn required(arg: Option<&str>, verb: &'static str) -> Result<f64, ParseError> {
    parse_mm(arg.ok_or(ParseError::MissingArgument(verb))?)
}

/// What the host loop should do after a command.
#[derive(Debug, Clone, PartialEq)]
pub enum Flow {
    /// Keep reading input, printing the message if any
    Continue(Option<String>),
    /// Leave the loop
    Quit,
}

/// Console state carried between commands.
#[derive(Debug, Clone)]
pub struct Console {
    jog_mm: f64,
}

impl Default for Console {
    fn default() -> Self {
        Self {
            jog_mm: DEFAULT_JOG_MM,
        }
    }
}

impl Console {
    /// Current jog step in mm.
    pub fn jog_mm(&self) -> f64 {
        self.jog_mm
    }

    /// Apply a command to the session and produce a reply for the user.
    ///
    /// `Quit` does not close the session; the host loop owns shutdown.
    pub fn apply<T: Transport>(
        &mut self,
        session: &mut Session<T>,
        command: ConsoleCommand,
    ) -> StageResult<Flow> {
        let reply = match command {
            ConsoleCommand::Left(mm) => {
                let distance = mm.unwrap_or(self.jog_mm).abs();
                describe_move(session.move_relative(-distance)?)
            }
            ConsoleCommand::Right(mm) => {
                let distance = mm.unwrap_or(self.jog_mm).abs();
                describe_move(session.move_relative(distance)?)
            }
            ConsoleCommand::SetStep(mm) => {
                self.jog_mm = mm.abs();
                Some(format!("Jog step set to {:.3} mm", self.jog_mm))
            }
            ConsoleCommand::Goto(mm) => describe_move(session.move_absolute(mm)?),
            ConsoleCommand::Stop => {
                let dropped = session.stop()?;
                Some(format!("Stopped ({dropped} queued moves dropped)"))
            }
            ConsoleCommand::Save => Some(match session.save_position()? {
                SaveOutcome::Confirmed => "Position saved to device".to_string(),
                SaveOutcome::Unconfirmed => {
                    "Warning: no save confirmation from device".to_string()
                }
            }),
            ConsoleCommand::Load => {
                session.load_position()?;
                Some("Requested saved position from device".to_string())
            }
            ConsoleCommand::Calibrate(mm) => {
                let steps = session.calibrate(mm)?;
                let actual = session.position_model().scale().steps_to_mm(steps);
                Some(format!("Calibrated to {actual:.3} mm ({steps} steps)"))
            }
            ConsoleCommand::Status => Some(render_status(&session.status())),
            ConsoleCommand::Help => Some(HELP.to_string()),
            ConsoleCommand::Quit => return Ok(Flow::Quit),
        };
        Ok(Flow::Continue(reply))
    }
}

fn describe_move(outcome: MoveOutcome) -> Option<String> {
    match outcome {
        MoveOutcome::Queued { clamped: true, .. } => {
            Some("Target outside travel range, clamped".to_string())
        }
        MoveOutcome::Queued { .. } => None,
        MoveOutcome::LimitReached { .. } => Some("Limit reached".to_string()),
        MoveOutcome::AlreadyAtTarget { .. } => Some("Already at target".to_string()),
    }
}

/// Position readout, e.g. `12.345 mm`.
pub fn render_position(mm: f64) -> String {
    format!("{mm:.3} mm")
}

/// Fraction of travel covered, clamped to `[0, 1]`.
pub fn travel_fraction(mm: f64, max_range_mm: f64) -> f64 {
    if max_range_mm <= 0.0 {
        return 0.0;
    }
    (mm / max_range_mm).clamp(0.0, 1.0)
}

/// Travel bar with overlay text, e.g. `[######......] 12.35 / 50.0 mm`.
pub fn render_travel_bar(mm: f64, max_range_mm: f64, width: usize) -> String {
    let filled = (travel_fraction(mm, max_range_mm) * width as f64).round() as usize;
    let filled = filled.min(width);
    format!(
        "[{}{}] {mm:.2} / {max_range_mm:.1} mm",
        "#".repeat(filled),
        ".".repeat(width - filled)
    )
}

/// Multi-line status block for the `status` command.
pub fn render_status(status: &StatusSnapshot) -> String {
    let state = match status.state {
        SessionState::Disconnected => "disconnected",
        SessionState::Idle => "idle",
        SessionState::Busy => "moving",
    };

    let mut out = format!(
        "{}  ({} steps, {state})\n{}",
        render_position(status.position_mm),
        status.position_steps,
        render_travel_bar(status.position_mm, status.max_range_mm, BAR_WIDTH)
    );
    if status.pending > 0 {
        let _ = write!(out, "\n{} moves queued", status.pending);
    }
    out
}

/// One-line description of an event worth showing, if any.
pub fn describe_event(event: &SessionEvent) -> Option<String> {
    match event {
        SessionEvent::PositionChanged {
            mm,
            source: PositionSource::Device,
            ..
        } => Some(format!("Position loaded from device: {}", render_position(*mm))),
        SessionEvent::MoveTimedOut { target, dropped } => Some(format!(
            "Warning: move to {target} steps was never acknowledged ({dropped} queued moves dropped)"
        )),
        SessionEvent::SaveUnconfirmed => {
            Some("Warning: no save confirmation from device".to_string())
        }
        SessionEvent::Disconnected { reason } => {
            Some(format!("Connection lost: {reason}"))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageConfig;
    use crate::transport::SimulatedStage;

    #[test]
    fn parse_moves() {
        assert_eq!(
            ConsoleCommand::parse("left").unwrap(),
            Some(ConsoleCommand::Left(None))
        );
        assert_eq!(
            ConsoleCommand::parse("> 0.25").unwrap(),
            Some(ConsoleCommand::Right(Some(0.25)))
        );
        assert_eq!(
            ConsoleCommand::parse("  GOTO 25 ").unwrap(),
            Some(ConsoleCommand::Goto(25.0))
        );
        assert_eq!(
            ConsoleCommand::parse("cal 12.5").unwrap(),
            Some(ConsoleCommand::Calibrate(12.5))
        );
        assert_eq!(ConsoleCommand::parse("").unwrap(), None);
    }

    #[test]
    fn parse_errors() {
        assert_eq!(
            ConsoleCommand::parse("goto"),
            Err(ParseError::MissingArgument("goto"))
        );
        assert_eq!(
            ConsoleCommand::parse("goto far"),
            Err(ParseError::InvalidNumber("far".into()))
        );
        assert_eq!(
            ConsoleCommand::parse("goto inf"),
            Err(ParseError::InvalidNumber("inf".into()))
        );
        assert_eq!(
            ConsoleCommand::parse("stop now"),
            Err(ParseError::TrailingInput("now".into()))
        );
        assert_eq!(
            ConsoleCommand::parse("jump"),
            Err(ParseError::Unknown("jump".into()))
        );
    }

    #[test]
    fn travel_bar_clamps_fraction() {
        assert_eq!(travel_fraction(-1.0, 50.0), 0.0);
        assert_eq!(travel_fraction(75.0, 50.0), 1.0);
        assert_eq!(
            render_travel_bar(25.0, 50.0, 10),
            "[#####.....] 25.00 / 50.0 mm"
        );
        assert_eq!(
            render_travel_bar(80.0, 50.0, 4),
            "[####] 80.00 / 50.0 mm"
        );
    }

    #[test]
    fn position_readout_has_three_decimals() {
        assert_eq!(render_position(12.3456), "12.346 mm");
        assert_eq!(render_position(0.0), "0.000 mm");
    }

    #[test]
    fn jog_uses_configured_step() {
        let config = StageConfig::default();
        let (mut session, _events) = Session::from_config(SimulatedStage::instant(), &config);
        let mut console = Console::default();

        console
            .apply(&mut session, ConsoleCommand::SetStep(0.5))
            .unwrap();
        console
            .apply(&mut session, ConsoleCommand::Right(None))
            .unwrap();
        assert_eq!(session.position_steps(), 1600);

        console
            .apply(&mut session, ConsoleCommand::Left(Some(2.0)))
            .unwrap();
        assert_eq!(session.position_steps(), 0);
        assert_eq!(session.pending_len(), 2);
    }

    #[test]
    fn left_at_zero_reports_limit() {
        let config = StageConfig::default();
        let (mut session, _events) = Session::from_config(SimulatedStage::instant(), &config);
        let mut console = Console::default();

        let flow = console
            .apply(&mut session, ConsoleCommand::Left(None))
            .unwrap();
        assert_eq!(flow, Flow::Continue(Some("Limit reached".to_string())));
    }

    #[test]
    fn quit_leaves_session_open() {
        let config = StageConfig::default();
        let (mut session, _events) = Session::from_config(SimulatedStage::instant(), &config);
        let mut console = Console::default();
        assert_eq!(
            console.apply(&mut session, ConsoleCommand::Quit).unwrap(),
            Flow::Quit
        );
        assert!(session.is_connected());
    }

    #[test]
    fn status_mentions_queue() {
        let status = StatusSnapshot {
            state: SessionState::Busy,
            position_steps: 40_000,
            position_mm: 12.5,
            max_range_mm: 50.0,
            pending: 2,
            in_flight: Some(32_000),
            port: "simulated".into(),
        };
        let text = render_status(&status);
        assert!(text.starts_with("12.500 mm  (40000 steps, moving)"));
        assert!(text.contains("12.50 / 50.0 mm"));
        assert!(text.ends_with("2 moves queued"));
    }
}
