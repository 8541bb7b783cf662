//! Validated sweep parameters.

use crate::adapters::visa_adapter::gpib_resource;
use crate::config::{AppConfig, SweepSettings};
use crate::error::{AppResult, DaqError};
use crate::hardware::qpt::integer::{PAN_MAX, PAN_MIN, TILT_MAX, TILT_MIN};
use crate::instrument::{FrequencySpec, Hp8753d};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Axis swept during a measurement. The other axis holds a fixed angle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SweepAxis {
    /// Azimuth, 360 degrees starting at -180.
    #[default]
    Pan,
    /// Elevation, 180 degrees starting at -90.
    Tilt,
}

impl SweepAxis {
    /// Travel covered by a sweep along this axis, degrees.
    pub fn full_range(self) -> f64 {
        match self {
            SweepAxis::Pan => PAN_MAX - PAN_MIN,
            SweepAxis::Tilt => TILT_MAX - TILT_MIN,
        }
    }

    /// Lower end of the axis, before any offset.
    pub fn origin(self) -> f64 {
        match self {
            SweepAxis::Pan => PAN_MIN,
            SweepAxis::Tilt => TILT_MIN,
        }
    }

    /// Upper end of the axis.
    pub fn extreme(self) -> f64 {
        match self {
            SweepAxis::Pan => PAN_MAX,
            SweepAxis::Tilt => TILT_MAX,
        }
    }
}

impl fmt::Display for SweepAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SweepAxis::Pan => write!(f, "pan"),
            SweepAxis::Tilt => write!(f, "tilt"),
        }
    }
}

/// How the positioner travels between measurements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MovementMode {
    /// Stop at every angle.
    #[default]
    Step,
    /// Jog at constant speed and measure on the fly.
    Continuous,
}

impl fmt::Display for MovementMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MovementMode::Step => write!(f, "step"),
            MovementMode::Continuous => write!(f, "continuous"),
        }
    }
}

/// Everything a sweep needs, checked once before any hardware is touched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Take an S11 trace at the start as well as the S21 sweep.
    pub impedance: bool,
    /// Frequencies measured at every position.
    pub frequencies: FrequencySpec,
    /// Run the open/short/load calibration during setup.
    pub calibration: bool,
    /// Analyzer averaging factor.
    pub averaging: u32,
    /// Requested movement mode. Setup may fall back to step.
    pub movement: MovementMode,
    /// Added to every pan target.
    pub pan_offset: f64,
    /// Added to every tilt target.
    pub tilt_offset: f64,
    /// Axis that is swept.
    pub axis: SweepAxis,
    /// Angle held by the axis that is not swept.
    pub fixed_angle: f64,
    /// Degrees between measurements.
    pub resolution: f64,
    /// Analyzer GPIB address.
    pub gpib_address: u8,
    /// Positioner serial port.
    pub serial_port: String,
    /// Positioner line speed.
    pub baud_rate: u32,
}

impl SweepConfig {
    /// Build from front-end settings and the application configuration.
    ///
    /// `gpib_addr` in the settings wins over `[instrument] gpib_address`.
    pub fn from_settings(settings: &SweepSettings, app: &AppConfig) -> AppResult<Self> {
        let frequencies = match (&settings.list, &settings.linear) {
            (Some(list), _) => FrequencySpec::List(list.clone()),
            (None, Some(linear)) => FrequencySpec::Linear {
                start: linear.start,
                stop: linear.stop,
                points: linear.points,
            },
            (None, None) => {
                return Err(DaqError::Configuration(
                    "sweep settings need either a frequency list or a linear sweep".to_string(),
                ))
            }
        };

        let config = Self {
            impedance: settings.impedance,
            frequencies,
            calibration: settings.calibration,
            averaging: settings.averaging,
            movement: settings.positioner_mv,
            pan_offset: settings.offset.pan,
            tilt_offset: settings.offset.tilt,
            axis: settings.sweep_axis,
            fixed_angle: settings.fixed_angle,
            resolution: settings.resolution,
            gpib_address: settings.gpib_addr.unwrap_or(app.instrument.gpib_address),
            serial_port: app.positioner.port.clone(),
            baud_rate: app.positioner.baud_rate,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check ranges: frequencies, averaging, resolution and angles.
    pub fn validate(&self) -> AppResult<()> {
        self.frequencies.validate()?;

        if !(1..=Hp8753d::MAX_AVERAGING).contains(&self.averaging) {
            return Err(DaqError::Configuration(format!(
                "averaging factor {} is outside 1..={}",
                self.averaging,
                Hp8753d::MAX_AVERAGING
            )));
        }

        let full = self.axis.full_range();
        if !self.resolution.is_finite() || self.resolution <= 0.0 || self.resolution > full {
            return Err(DaqError::Configuration(format!(
                "resolution {} must be in (0, {full}] degrees for a {} sweep",
                self.resolution, self.axis
            )));
        }

        let (fixed_min, fixed_max) = match self.axis {
            SweepAxis::Pan => (TILT_MIN, TILT_MAX),
            SweepAxis::Tilt => (PAN_MIN, PAN_MAX),
        };
        let fixed = self.fixed_position_offset() + self.fixed_angle;
        if !(fixed_min..=fixed_max).contains(&fixed) {
            return Err(DaqError::Configuration(format!(
                "fixed angle {fixed} is outside [{fixed_min}, {fixed_max}]"
            )));
        }

        let (first, last) = (self.target(1), self.target(self.total_steps()));
        let (lo, hi) = (self.axis.origin(), self.axis.extreme());
        if !(first.is_finite() && first >= lo && last <= hi) {
            return Err(DaqError::Configuration(format!(
                "{} sweep from {first} to {last} leaves [{lo}, {hi}]; check the offsets",
                self.axis
            )));
        }

        if self.serial_port.trim().is_empty() || self.baud_rate == 0 {
            return Err(DaqError::Configuration(
                "positioner serial port and baud rate must be set".to_string(),
            ));
        }
        Ok(())
    }

    /// Offset of the swept axis.
    fn swept_offset(&self) -> f64 {
        match self.axis {
            SweepAxis::Pan => self.pan_offset,
            SweepAxis::Tilt => self.tilt_offset,
        }
    }

    /// Offset of the held axis.
    fn fixed_position_offset(&self) -> f64 {
        match self.axis {
            SweepAxis::Pan => self.tilt_offset,
            SweepAxis::Tilt => self.pan_offset,
        }
    }

    /// Measurement positions in one sweep.
    pub fn total_steps(&self) -> u32 {
        (self.axis.full_range() / self.resolution).round().max(1.0) as u32
    }

    /// Swept-axis angle of the first measurement.
    pub fn start_angle(&self) -> f64 {
        self.axis.origin() + self.swept_offset()
    }

    /// Swept-axis angle of step `step` (1-based).
    pub fn target(&self, step: u32) -> f64 {
        self.start_angle() + f64::from(step.saturating_sub(1)) * self.resolution
    }

    /// `(pan, tilt)` for a swept-axis angle.
    pub fn position_for(&self, swept: f64) -> (f64, f64) {
        let held = self.fixed_angle + self.fixed_position_offset();
        match self.axis {
            SweepAxis::Pan => (swept, held),
            SweepAxis::Tilt => (held, swept),
        }
    }

    /// Percent complete after step `step`. Exactly 100 on the last step.
    pub fn progress(&self, step: u32) -> u8 {
        if step >= self.total_steps() {
            return 100;
        }
        let pct = f64::from(step) * self.resolution * 100.0 / self.axis.full_range();
        pct.clamp(0.0, 100.0) as u8
    }

    /// VISA resource string of the analyzer.
    pub fn instrument_resource(&self) -> String {
        gpib_resource(self.gpib_address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LinearSettings, OffsetSettings};

    fn settings(resolution: f64) -> SweepSettings {
        SweepSettings {
            impedance: false,
            list: Some(vec![1000.0, 2000.0]),
            linear: None,
            calibration: false,
            averaging: 4,
            positioner_mv: MovementMode::Step,
            offset: OffsetSettings::default(),
            sweep_axis: SweepAxis::Pan,
            fixed_angle: 0.0,
            resolution,
            gpib_addr: None,
        }
    }

    #[test]
    fn thirty_degree_pan_sweep() {
        let config = SweepConfig::from_settings(&settings(30.0), &AppConfig::default()).unwrap();
        assert_eq!(config.total_steps(), 12);
        assert_eq!(config.target(1), -180.0);
        assert_eq!(config.target(12), 150.0);
        assert_eq!(config.progress(1), 8);
        assert_eq!(config.progress(11), 91);
        assert_eq!(config.progress(12), 100);
        assert_eq!(config.position_for(-150.0), (-150.0, 0.0));
        assert_eq!(config.instrument_resource(), "GPIB0::16::INSTR");
    }

    #[test]
    fn uneven_resolution_still_ends_at_100() {
        let config = SweepConfig::from_settings(&settings(7.0), &AppConfig::default()).unwrap();
        let n = config.total_steps();
        assert_eq!(n, 51);
        assert!(config.target(n) <= 180.0);
        assert!((1..n).all(|k| config.progress(k) < 100));
        assert_eq!(config.progress(n), 100);
    }

    #[test]
    fn tilt_sweep_holds_pan() {
        let mut s = settings(10.0);
        s.sweep_axis = SweepAxis::Tilt;
        s.fixed_angle = 45.0;
        s.offset = OffsetSettings { pan: 1.0, tilt: 2.0 };
        let config = SweepConfig::from_settings(&s, &AppConfig::default()).unwrap();
        assert_eq!(config.total_steps(), 18);
        assert_eq!(config.start_angle(), -88.0);
        assert_eq!(config.position_for(config.start_angle()), (46.0, -88.0));
    }

    #[test]
    fn linear_settings_and_address_override() {
        let mut s = settings(30.0);
        s.list = None;
        s.linear = Some(LinearSettings {
            start: 1000.0,
            stop: 3000.0,
            points: 201,
        });
        s.gpib_addr = Some(20);
        let config = SweepConfig::from_settings(&s, &AppConfig::default()).unwrap();
        assert_eq!(config.frequencies.count(), 201);
        assert_eq!(config.gpib_address, 20);
    }

    #[test]
    fn rejects_bad_settings() {
        let app = AppConfig::default();
        assert!(SweepConfig::from_settings(&settings(0.0), &app).is_err());
        assert!(SweepConfig::from_settings(&settings(400.0), &app).is_err());

        let mut s = settings(30.0);
        s.list = Some(vec![1000.0; 31]);
        assert!(SweepConfig::from_settings(&s, &app).is_err());

        let mut s = settings(30.0);
        s.list = None;
        assert!(SweepConfig::from_settings(&s, &app).is_err());

        let mut s = settings(30.0);
        s.offset.pan = -5.0;
        assert!(SweepConfig::from_settings(&s, &app).is_err());

        let mut s = settings(30.0);
        s.fixed_angle = 120.0;
        assert!(SweepConfig::from_settings(&s, &app).is_err());

        let mut s = settings(30.0);
        s.averaging = 0;
        assert!(SweepConfig::from_settings(&s, &app).is_err());
    }
}
