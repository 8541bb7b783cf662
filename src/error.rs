//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the entire crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of failures that occur while driving a far-field measurement,
//! from configuration problems to transport timeouts on the positioner link.
//!
//! ## Error Hierarchy
//!
//! `DaqError` consolidates the following sources:
//!
//! - **`Config`**: Wraps errors from `figment` when a configuration file or environment
//!   override cannot be parsed.
//! - **`Configuration`**: Semantic errors in settings that parse correctly but are
//!   logically invalid (a frequency list longer than 30 entries, an angular resolution
//!   of zero, an unknown sweep axis). These are raised before any hardware is touched.
//! - **`Transport`**: Serial or VISA link failures. Adapters report these with `anyhow`
//!   context chains which are carried through unchanged.
//! - **`Instrument`** / **`UnsupportedModel`**: Problems reported by or about the VNA.
//! - **`Codec`**: Range errors from the positioner wire encoding, see [`CodecError`].
//! - **`Sweep`**: Invalid state transitions requested of the sweep controller.
//! - **`FeatureNotEnabled`**: Functionality compiled out through feature flags.
//!
//! Hardware fault conditions reported by the positioner (limit switches, overloads,
//! resolver faults) are *not* errors; they are status bits on
//! [`crate::hardware::qpt::PositionerStatus`].

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Every failure the library reports.
#[derive(Error, Debug)]
pub enum DaqError {
    /// The configuration sources could not be merged or parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// A configuration value was rejected by validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// File system failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Writing the measurement file failed.
    #[error("CSV output error: {0}")]
    Csv(#[from] csv::Error),

    /// Serial or GPIB transport failure, with its context chain.
    #[error("Transport error: {0:#}")]
    Transport(#[from] anyhow::Error),

    /// The analyzer misbehaved or returned unusable data.
    #[error("Instrument error: {0}")]
    Instrument(String),

    /// The analyzer identified as a model without a command table.
    #[error("Unsupported instrument model: '{0}'")]
    UnsupportedModel(String),

    /// A wire value could not be built or read.
    #[error("Encoding error: {0}")]
    Codec(#[from] CodecError),

    /// The positioner link is down or never came up.
    #[error("Positioner not connected")]
    PositionerNotConnected,

    /// The positioner controller task has exited.
    #[error("Positioner controller is no longer running")]
    PositionerUnavailable,

    /// A sweep request is not valid in the current state.
    #[error("Sweep error: {0}")]
    Sweep(String),

    /// The requested transport was compiled out.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

/// Errors produced while building positioner wire values.
///
/// Construction never clamps or wraps: anything outside the representable or
/// permitted range is rejected with one of these.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    /// Value outside `i16`.
    #[error("integer {0} does not fit in a signed 16-bit word")]
    IntegerOutOfRange(i64),

    /// Angle outside the axis travel.
    #[error("{axis} angle {value:.2} outside [{min:.2}, {max:.2}]")]
    AngleOutOfRange {
        /// `"pan"` or `"tilt"`.
        axis: &'static str,
        /// Requested angle in degrees.
        value: f64,
        /// Lower bound in degrees.
        min: f64,
        /// Upper bound in degrees.
        max: f64,
    },

    /// Command argument outside its permitted range.
    #[error("{name} = {value} outside [{min}, {max}]")]
    InvalidArgument {
        /// Argument name.
        name: &'static str,
        /// Rejected value.
        value: i64,
        /// Smallest permitted value.
        min: i64,
        /// Largest permitted value.
        max: i64,
    },

    /// Frame shorter than the minimum; carries its length.
    #[error("frame truncated ({0} bytes)")]
    Truncated(usize),

    /// Frame does not start with STX and end with ETX.
    #[error("frame is missing STX/ETX delimiters")]
    MissingDelimiter,
}
