//! Stage Controller Wire Protocol
//!
//! Protocol Overview:
//! - Format: ASCII, one command or response per line, `\n` terminated
//! - Commands carry an optional signed integer argument in device steps
//! - Responses are `OK`, `SAVED` or `POS:<steps>`
//!
//! | Direction | Line | Meaning |
//! |---|---|---|
//! | host → device | `M<int>` | move to absolute step position |
//! | host → device | `S` | stop immediately |
//! | host → device | `P` | save current position to EEPROM |
//! | host → device | `L` | load saved position from EEPROM (answers `POS:<int>`) |
//! | host → device | `C<int>` | overwrite the position counter, no motion |
//! | device → host | `OK` | the previous move completed |
//! | device → host | `SAVED` | EEPROM save completed |
//! | device → host | `POS:<int>` | current/loaded absolute position |
//!
//! The codec is pure and stateless. Decoding never fails: anything that is
//! not one of the three known responses becomes [`Response::Unrecognized`] and
//! is dropped by the session.

use std::fmt;

/// Line terminator appended to every outgoing command.
pub const LINE_TERMINATOR: u8 = b'\n';

const POSITION_PREFIX: &str = "POS:";

/// A request to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Move to an absolute position in steps.
    MoveAbsolute(i64),
    /// Abort any motion in progress.
    Stop,
    /// Persist the device position to EEPROM.
    SavePosition,
    /// Restore the position from EEPROM and report it.
    LoadPosition,
    /// Overwrite the device position counter without moving.
    Calibrate(i64),
}

/// A decoded line received from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    /// A move command completed.
    Ack,
    /// The EEPROM save completed.
    Saved,
    /// Absolute position in steps.
    PositionReport(i64),
    /// Anything else, including garbled bytes. Never an error.
    Unrecognized,
}

impl Command {
    /// Single-letter opcode used on the wire.
    pub fn opcode(&self) -> char {
        match self {
            Command::MoveAbsolute(_) => 'M',
            Command::Stop => 'S',
            Command::SavePosition => 'P',
            Command::LoadPosition => 'L',
            Command::Calibrate(_) => 'C',
        }
    }

    /// Parse a command line as the device would.
    ///
    /// Returns `None` for unknown opcodes, missing or malformed arguments and
    /// trailing junk after argument-less opcodes.
    pub fn parse(line: &[u8]) -> Option<Command> {
        let text = std::str::from_utf8(line).ok()?.trim();
        let mut chars = text.chars();
        let opcode = chars.next()?;
        let rest = chars.as_str();

        match opcode {
            'M' => parse_steps(rest).map(Command::MoveAbsolute),
            'C' => parse_steps(rest).map(Command::Calibrate),
            'S' if rest.is_empty() => Some(Command::Stop),
            'P' if rest.is_empty() => Some(Command::SavePosition),
            'L' if rest.is_empty() => Some(Command::LoadPosition),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::MoveAbsolute(steps) | Command::Calibrate(steps) => {
                write!(f, "{}{}", self.opcode(), steps)
            }
            _ => write!(f, "{}", self.opcode()),
        }
    }
}

/// Encode a command into its wire form, including the trailing newline.
pub fn encode(command: &Command) -> Vec<u8> {
    let mut line = command.to_string().into_bytes();
    line.push(LINE_TERMINATOR);
    line
}

/// Decode one already-received line.
///
/// Surrounding whitespace (including `\r\n`) is ignored. Non-ASCII input,
/// unknown keywords and malformed integers all map to
/// [`Response::Unrecognized`].
pub fn decode(line: &[u8]) -> Response {
    let Ok(text) = std::str::from_utf8(line) else {
        return Response::Unrecognized;
    };
    let text = text.trim();
    if !text.is_ascii() {
        return Response::Unrecognized;
    }

    match text {
        "OK" => Response::Ack,
        "SAVED" => Response::Saved,
        _ => text
            .strip_prefix(POSITION_PREFIX)
            .and_then(parse_steps)
            .map_or(Response::Unrecognized, Response::PositionReport),
    }
}

/// Encode a response line as the device would send it.
pub fn encode_response(response: &Response) -> Option<Vec<u8>> {
    let text = match response {
        Response::Ack => "OK".to_string(),
        Response::Saved => "SAVED".to_string(),
        Response::PositionReport(steps) => format!("{POSITION_PREFIX}{steps}"),
        Response::Unrecognized => return None,
    };
    let mut line = text.into_bytes();
    line.push(LINE_TERMINATOR);
    Some(line)
}

fn parse_steps(text: &str) -> Option<i64> {
    // i64::from_str accepts a leading '+', which the firmware does not send
    // but tolerates; whitespace inside the number is rejected.
    if text.is_empty() || text.contains(char::is_whitespace) {
        return None;
    }
    text.parse().ok()
}
