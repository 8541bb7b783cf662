use serde::{Deserialize, Serialize};
use std::fmt;

/// Which scattering parameter a sample holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MeasurementKind {
    /// Reflection at port 1.
    S11,
    /// Transmission from port 1 to port 2.
    S21,
}

impl fmt::Display for MeasurementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeasurementKind::S11 => f.write_str("S11"),
            MeasurementKind::S21 => f.write_str("S21"),
        }
    }
}

/// One reading: what was measured, at which frequency, at which position.
///
/// `theta` is elevation and `phi` is azimuth, both in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeasurementSample {
    /// Parameter measured.
    pub kind: MeasurementKind,
    /// MHz
    pub freq: f64,
    /// degrees
    pub theta: f64,
    /// degrees
    pub phi: f64,
    /// dB
    pub magnitude: f64,
    /// degrees
    pub phase: f64,
}

impl MeasurementSample {
    /// Output row, field order `measurement_type,freq,theta,phi,magnitude,phase`.
    ///
    /// Frequency is written as whole MHz, truncated.
    pub fn to_record(&self) -> [String; 6] {
        [
            self.kind.to_string(),
            format!("{}", self.freq.trunc() as i64),
            format!("{:.6}", self.theta),
            format!("{:.6}", self.phi),
            format!("{:.6}", self.magnitude),
            format!("{:.6}", self.phase),
        ]
    }
}
