//! Configuration System using Figment
//!
//! Configuration is layered, lowest precedence first:
//! 1. Built-in defaults (every field has one)
//! 2. A TOML file (`farfield.toml` unless another path is given)
//! 3. Environment variables prefixed with `FARFIELD_`, nested keys split on `__`
//!
//! ```text
//! FARFIELD_APPLICATION__LOG_LEVEL=debug
//! FARFIELD_POSITIONER__PORT=/dev/ttyUSB1
//! FARFIELD_INSTRUMENT__GPIB_ADDRESS=17
//! ```
//!
//! Sweep settings can live in the `[sweep]` table, or in the JSON settings
//! document written by the operator front end (see [`SweepSettings`]).

use crate::error::{AppResult, DaqError};
use crate::experiment::{MovementMode, SweepAxis, TimingTable};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "farfield.toml";

const VALID_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const VALID_FORMATS: [&str; 3] = ["pretty", "compact", "json"];

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Logging and output locations
    pub application: ApplicationConfig,
    /// Positioner serial link
    pub positioner: PositionerConfig,
    /// Network analyzer link
    pub instrument: InstrumentConfig,
    /// Sweep to run when none is given on the command line.
    pub sweep: Option<SweepSettings>,
    /// Replacement analyzer delay table.
    pub vna_timing: Option<TimingTable>,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
    /// Directory that receives measurement files
    pub output_dir: PathBuf,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            output_dir: PathBuf::from("."),
        }
    }
}

/// QPT positioner link and controller timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionerConfig {
    /// Serial port (e.g., "/dev/ttyUSB0", "COM3")
    pub port: String,
    /// Line speed
    pub baud_rate: u32,
    /// Reply wait per exchange
    pub exchange_timeout_ms: u64,
    /// Pause after every exchange
    pub inter_frame_delay_ms: u64,
    /// Wait between a move command and the status refresh that follows it
    pub settle_delay_ms: u64,
    /// Status queries attempted before the link is declared dead
    pub connect_retries: u32,
    /// Controller loop period
    pub poll_interval_ms: u64,
    /// Speed used for operator jogs
    pub panel_jog_speed: u8,
}

impl Default for PositionerConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            exchange_timeout_ms: 30,
            inter_frame_delay_ms: 20,
            settle_delay_ms: 120,
            connect_retries: 25,
            poll_interval_ms: 120,
            panel_jog_speed: 30,
        }
    }
}

/// Network analyzer link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentConfig {
    /// Primary GPIB address, overridden by `gpib_addr` in sweep settings
    pub gpib_address: u8,
    /// I/O timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            gpib_address: 16,
            timeout_ms: 5000,
        }
    }
}

impl AppConfig {
    /// Load from [`DEFAULT_CONFIG_FILE`] and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load from `path` and the environment, then validate.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("FARFIELD_").split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would only fail later, at the hardware.
    pub fn validate(&self) -> AppResult<()> {
        let level = self.application.log_level.to_lowercase();
        if !VALID_LEVELS.contains(&level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                VALID_LEVELS.join(", ")
            )));
        }

        let format = self.application.log_format.to_lowercase();
        if !VALID_FORMATS.contains(&format.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                VALID_FORMATS.join(", ")
            )));
        }

        let p = &self.positioner;
        if p.port.trim().is_empty() {
            return Err(DaqError::Configuration(
                "positioner port cannot be empty".to_string(),
            ));
        }
        if p.baud_rate == 0 {
            return Err(DaqError::Configuration(
                "positioner baud_rate must be non-zero".to_string(),
            ));
        }
        if p.connect_retries == 0 {
            return Err(DaqError::Configuration(
                "positioner connect_retries must be at least 1".to_string(),
            ));
        }
        if p.exchange_timeout_ms == 0 || p.poll_interval_ms == 0 {
            return Err(DaqError::Configuration(
                "positioner exchange_timeout_ms and poll_interval_ms must be non-zero".to_string(),
            ));
        }

        if self.instrument.gpib_address > 30 {
            return Err(DaqError::Configuration(format!(
                "Invalid GPIB address {}. Must be 0-30",
                self.instrument.gpib_address
            )));
        }

        Ok(())
    }
}

/// Linear frequency sweep, MHz.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearSettings {
    /// First frequency
    pub start: f64,
    /// Last frequency
    pub stop: f64,
    /// Number of points, both ends included
    pub points: u32,
}

/// Positioner offsets applied to the sweep start, degrees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OffsetSettings {
    /// Pan offset
    pub pan: f64,
    /// Tilt offset
    pub tilt: f64,
}

/// Sweep settings as written by the operator front end.
///
/// ```json
/// {
///   "impedance": true,
///   "list": [1000.0, 2400.0],
///   "linear": null,
///   "calibration": false,
///   "averaging": 8,
///   "positioner_mv": "step",
///   "offset": { "pan": 0.0, "tilt": 0.0 },
///   "sweep_axis": "pan",
///   "fixed_angle": 0.0,
///   "resolution": 30.0,
///   "gpib_addr": 16
/// }
/// ```
///
/// `list` wins over `linear` when both are present. Convert with
/// [`SweepConfig::from_settings`](crate::experiment::SweepConfig::from_settings),
/// which does the validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepSettings {
    /// Record one S11 trace before the sweep
    #[serde(default)]
    pub impedance: bool,
    /// List of frequencies, MHz
    #[serde(default)]
    pub list: Option<Vec<f64>>,
    /// Linear frequency sweep
    #[serde(default)]
    pub linear: Option<LinearSettings>,
    /// Run the open/short/load calibration first
    #[serde(default)]
    pub calibration: bool,
    /// Averaging factor
    #[serde(default = "default_averaging")]
    pub averaging: u32,
    /// Step or continuous movement
    #[serde(default)]
    pub positioner_mv: MovementMode,
    /// Offsets added to the start position
    #[serde(default)]
    pub offset: OffsetSettings,
    /// Axis swept; the other one is held
    #[serde(default)]
    pub sweep_axis: SweepAxis,
    /// Angle of the held axis, degrees
    #[serde(default)]
    pub fixed_angle: f64,
    /// Angle between measurements, degrees
    pub resolution: f64,
    /// Analyzer GPIB address; `[instrument]` is used when absent
    #[serde(default)]
    pub gpib_addr: Option<u8>,
}

fn default_averaging() -> u32 {
    1
}

impl SweepSettings {
    /// Read a JSON settings document.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| {
            DaqError::Configuration(format!(
                "Invalid sweep settings in {}: {e}",
                path.display()
            ))
        })
    }
}
