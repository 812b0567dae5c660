//! Log output for the control panel.
//!
//! Everything in the crate logs through `tracing`: lines on the wire at
//! `debug`, connection lifecycle at `info`, clamping, timeouts and link loss at
//! `warn`. Session operations run inside `#[instrument]` spans carrying the
//! port name. This module installs the global `tracing-subscriber` registry
//! that turns those events into text.
//!
//! `RUST_LOG` takes precedence over the configured level, so a single run can
//! be made chatty without editing the config file:
//!
//! ```bash
//! RUST_LOG=stage_control::session=trace stage-control run --simulate
//! ```
//!
//! # Example
//! ```no_run
//! use stage_control::{config::StageConfig, logging};
//!
//! let config = StageConfig::load()?;
//! logging::init_from_config(&config)?;
//! tracing::info!("Control panel started");
//! # Ok::<(), stage_control::StageError>(())
//! ```

use crate::config::{LoggingSettings, StageConfig};
use crate::error::{StageError, StageResult};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::level_filters::LevelFilter;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// How log lines are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Multi-line, coloured; for an operator watching the terminal
    Pretty,
    /// One line per event, no colour; for redirecting to a file
    Compact,
    /// Newline-delimited JSON
    Json,
}

/// Subscriber options resolved from [`LoggingSettings`].
#[derive(Debug, Clone, PartialEq)]
pub struct LogOptions {
    /// Default level when `RUST_LOG` is unset
    pub level: Level,
    /// Line rendering
    pub format: OutputFormat,
    /// Emit an event when a span (e.g. `save_position`) opens and closes.
    pub span_events: bool,
    /// Include `file:line` of the call site.
    pub source_location: bool,
}

impl LogOptions {
    /// Options with span events and source locations off.
    pub fn new(level: Level, format: OutputFormat) -> Self {
        Self {
            level,
            format,
            span_events: false,
            source_location: false,
        }
    }
}

impl TryFrom<&LoggingSettings> for LogOptions {
    type Error = StageError;

    fn try_from(settings: &LoggingSettings) -> StageResult<Self> {
        let level = parse_log_level(&settings.level).map_err(StageError::Configuration)?;
        Ok(Self {
            span_events: settings.span_events,
            source_location: settings.source_location,
            ..Self::new(level, settings.format)
        })
    }
}

/// Install the subscriber described by the `[logging]` section.
pub fn init_from_config(config: &StageConfig) -> StageResult<()> {
    init(LogOptions::try_from(&config.logging)?)
}

/// Install the global subscriber.
///
/// Only the first call in a process takes effect; later calls (from tests, or
/// from an application embedding the library that already set up logging)
/// return `Ok(())` and leave the existing subscriber in place.
pub fn init(options: LogOptions) -> StageResult<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(options.level).into())
        .from_env_lossy();

    let spans = if options.span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let base = fmt::layer()
        .with_span_events(spans)
        .with_file(options.source_location)
        .with_line_number(options.source_location);

    let layer = match options.format {
        OutputFormat::Pretty => base.pretty().with_filter(filter).boxed(),
        OutputFormat::Compact => base.compact().with_ansi(false).with_filter(filter).boxed(),
        OutputFormat::Json => base.json().with_filter(filter).boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(|e| StageError::Logging(e.to_string()))
}

/// Parse a level name (`trace` .. `error`, any case).
pub fn parse_log_level(level: &str) -> Result<Level, String> {
    Level::from_str(level.trim()).map_err(|_| {
        format!("Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error")
    })
}
