//! Configuration System using Figment
//!
//! Strongly-typed configuration for the stage controller. Sources are merged
//! in this order (later wins):
//! 1. Built-in defaults (matching the reference stage: 1600 steps/rev,
//!    0.5 mm/rev, 50 mm travel, 115200 baud)
//! 2. A TOML file (optional; missing files are skipped)
//! 3. Environment variables prefixed with `STAGE_CONTROL_`, using `__` to
//!    separate nesting levels
//!
//! # Example
//! ```no_run
//! use stage_control::config::StageConfig;
//!
//! // STAGE_CONTROL_SERIAL__PORT=/dev/ttyACM0 overrides the file
//! let config = StageConfig::load_from("config/stage.toml")?;
//! config.validate()?;
//! println!("Port: {}", config.serial.port);
//! # Ok::<(), stage_control::StageError>(())
//! ```

use crate::error::{StageError, StageResult};
use crate::logging::{parse_log_level, OutputFormat};
use crate::position::{PositionModel, StepScale};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/stage.toml";

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "STAGE_CONTROL_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Serial link settings
    pub serial: SerialConfig,
    /// Drive geometry and travel range
    pub stage: GeometryConfig,
    /// Protocol timing
    pub timing: TimingConfig,
    /// Log output
    pub logging: LoggingSettings,
}

/// Serial link settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0", "COM5")
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Per-read timeout of the underlying port in milliseconds
    pub read_timeout_ms: u64,
    /// Wait after opening the port for the controller to finish resetting
    pub settle_delay_ms: u64,
}

/// Drive geometry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeometryConfig {
    /// Microsteps per motor revolution
    pub steps_per_rev: u32,
    /// Linear travel per revolution in millimetres
    pub mm_per_rev: f64,
    /// Usable travel from the zero position in millimetres
    pub max_range_mm: f64,
}

/// Protocol timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// How long `save_position` waits for `SAVED`
    pub save_timeout_ms: u64,
    /// How long a move may stay unacknowledged (0 = wait forever)
    pub move_timeout_ms: u64,
    /// Host loop tick, and poll interval while waiting for `SAVED`
    pub poll_interval_ms: u64,
}

/// Log output settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Logging level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format (pretty, compact, json)
    pub format: OutputFormat,
    /// Log span open/close (one pair per session operation)
    pub span_events: bool,
    /// Include the source file and line of each event
    pub source_location: bool,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115_200,
            read_timeout_ms: 100,
            settle_delay_ms: 2000,
        }
    }
}

impl Default for GeometryConfig {
    fn default() -> Self {
        Self {
            steps_per_rev: 1600,
            mm_per_rev: 0.5,
            max_range_mm: 50.0,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            save_timeout_ms: 2000,
            move_timeout_ms: 60_000,
            poll_interval_ms: 10,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: OutputFormat::Pretty,
            span_events: false,
            source_location: false,
        }
    }
}

impl GeometryConfig {
    /// Steps/mm conversion for this geometry.
    pub fn scale(&self) -> StepScale {
        StepScale::from_geometry(self.steps_per_rev, self.mm_per_rev)
    }

    /// Fresh position model at 0 with this geometry's travel bounds.
    pub fn position_model(&self) -> PositionModel {
        PositionModel::new(self.scale(), self.max_range_mm)
    }
}

impl TimingConfig {
    /// How long `save_position` waits for `SAVED`.
    pub fn save_timeout(&self) -> Duration {
        Duration::from_millis(self.save_timeout_ms)
    }

    /// `None` when the move timeout is disabled.
    pub fn move_timeout(&self) -> Option<Duration> {
        (self.move_timeout_ms > 0).then(|| Duration::from_millis(self.move_timeout_ms))
    }

    /// Host loop tick.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl StageConfig {
    /// The figment used by [`load_from`](Self::load_from), exposed so callers
    /// can merge further providers.
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::from(Serialized::defaults(StageConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load configuration from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> StageResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path and the environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> StageResult<Self> {
        Ok(Self::figment(path).extract()?)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> StageResult<()> {
        if self.serial.port.trim().is_empty() {
            return Err(StageError::Configuration(
                "serial.port must not be empty".to_string(),
            ));
        }

        if self.serial.baud_rate == 0 {
            return Err(StageError::Configuration(
                "serial.baud_rate must be positive".to_string(),
            ));
        }

        if self.stage.steps_per_rev == 0 {
            return Err(StageError::Configuration(
                "stage.steps_per_rev must be positive".to_string(),
            ));
        }

        if !(self.stage.mm_per_rev.is_finite() && self.stage.mm_per_rev > 0.0) {
            return Err(StageError::Configuration(format!(
                "stage.mm_per_rev must be a positive number, got {}",
                self.stage.mm_per_rev
            )));
        }

        if !(self.stage.max_range_mm.is_finite() && self.stage.max_range_mm > 0.0) {
            return Err(StageError::Configuration(format!(
                "stage.max_range_mm must be a positive number, got {}",
                self.stage.max_range_mm
            )));
        }

        if self.timing.save_timeout_ms == 0 {
            return Err(StageError::Configuration(
                "timing.save_timeout_ms must be positive".to_string(),
            ));
        }

        if self.timing.poll_interval_ms == 0 {
            return Err(StageError::Configuration(
                "timing.poll_interval_ms must be positive".to_string(),
            ));
        }

        parse_log_level(&self.logging.level).map_err(StageError::Configuration)?;

        Ok(())
    }

    /// Render as TOML (used by `stage-control config`).
    pub fn to_toml(&self) -> StageResult<String> {
        toml::to_string_pretty(self).map_err(|e| StageError::Configuration(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = StageConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.serial.baud_rate, 115_200);
        assert_eq!(config.stage.scale().steps_per_mm(), 3200.0);
        assert_eq!(config.stage.position_model().bounds(), (0, 160_000));
    }

    #[test]
    fn test_move_timeout_zero_disables() {
        let mut timing = TimingConfig::default();
        assert_eq!(timing.move_timeout(), Some(Duration::from_secs(60)));
        timing.move_timeout_ms = 0;
        assert_eq!(timing.move_timeout(), None);
    }

    #[test]
    fn test_invalid_geometry() {
        let mut config = StageConfig::default();
        config.stage.mm_per_rev = 0.0;
        assert!(config.validate().is_err());

        let mut config = StageConfig::default();
        config.stage.max_range_mm = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = StageConfig::default();
        config.logging.level = "verbose".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid log level"));
    }

    #[test]
    fn test_zero_baud_rejected() {
        let mut config = StageConfig::default();
        config.serial.baud_rate = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_rendering_round_trips_through_figment() {
        let mut config = StageConfig::default();
        config.serial.port = "COM5".to_string();
        let rendered = config.to_toml().unwrap();

        let parsed: StageConfig = Figment::from(Toml::string(&rendered)).extract().unwrap();
        assert_eq!(parsed, config);
    }
}
