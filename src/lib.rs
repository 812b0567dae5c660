//! # Stage Control Library
//!
//! Host-side driver for a serial-attached stepper linear stage. The controller
//! firmware speaks a small line protocol (`M<n>`, `S`, `P`, `L`, `C<n>` out;
//! `OK`, `SAVED`, `POS:<n>` back); this crate turns millimetre-level requests
//! into that traffic while keeping exactly one move in flight.
//!
//! ## Crate Structure
//!
//! - **`protocol`**: the stateless wire codec (`Command`, `Response`,
//!   `encode`, `decode`).
//! - **`position`**: steps/mm conversion, travel bounds and the optimistic
//!   position model (`StepScale`, `PositionModel`, `MovePlan`).
//! - **`dispatcher`**: FIFO of absolute targets gated by the busy flag.
//! - **`session`**: the controller tying it together over one transport,
//!   with events for the front end and shutdown flushing.
//! - **`transport`**: the `Transport` trait with serial, mock and simulated
//!   implementations.
//! - **`config`**: layered configuration (defaults, TOML file, environment).
//! - **`console`**: the text control panel used by the `stage-control` binary.
//! - **`error`**: the crate-wide `StageError` enum.
//! - **`logging`**: `tracing-subscriber` initialisation.

pub mod config;
pub mod console;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod position;
pub mod protocol;
pub mod session;
pub mod transport;

pub use error::{StageError, StageResult};
