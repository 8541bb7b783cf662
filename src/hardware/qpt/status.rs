//! Positioner status snapshot.

use super::integer::{Coordinate, PositionerCalibration};
use serde::Serialize;

/// Fault and limit bits reported for one axis.
///
/// Pan uses the CW/CCW naming, tilt maps the same bits to up/down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AxisFaults {
    /// Bit 7: CW/up soft limit reached.
    pub forward_soft_limit: bool,
    /// Bit 6: CCW/down soft limit reached.
    pub reverse_soft_limit: bool,
    /// Bit 5: CW/up hard limit reached.
    pub forward_hard_limit: bool,
    /// Bit 4: CCW/down hard limit reached.
    pub reverse_hard_limit: bool,
    /// Bit 3: motion timed out.
    pub timeout: bool,
    /// Bit 2: moved the wrong way.
    pub direction_error: bool,
    /// Bit 1.
    pub current_overload: bool,
    /// Bit 0.
    pub resolver_fault: bool,
}

impl AxisFaults {
    /// Decode the per-axis status byte.
    pub fn from_bits(bits: u8) -> Self {
        Self {
            forward_soft_limit: bits & 0x80 != 0,
            reverse_soft_limit: bits & 0x40 != 0,
            forward_hard_limit: bits & 0x20 != 0,
            reverse_hard_limit: bits & 0x10 != 0,
            timeout: bits & 0x08 != 0,
            direction_error: bits & 0x04 != 0,
            current_overload: bits & 0x02 != 0,
            resolver_fault: bits & 0x01 != 0,
        }
    }

    /// True when any hard fault is latched. Soft limits are not faults.
    pub fn any_hard_fault(&self) -> bool {
        self.forward_hard_limit
            || self.reverse_hard_limit
            || self.timeout
            || self.direction_error
            || self.current_overload
            || self.resolver_fault
    }
}

/// Motion and mode bits from the general status byte.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MotionFlags {
    /// Bit 7.
    pub high_resolution: bool,
    /// Bit 6: a command is executing.
    pub executing: bool,
    /// Bit 5.
    pub destination_reached: bool,
    /// Bit 4: soft limits are being ignored.
    pub soft_limit_override: bool,
    /// Bit 3.
    pub moving_cw: bool,
    /// Bit 2.
    pub moving_ccw: bool,
    /// Bit 1.
    pub moving_up: bool,
    /// Bit 0.
    pub moving_down: bool,
}

impl MotionFlags {
    /// Decode the general status byte.
    pub fn from_bits(bits: u8) -> Self {
        Self {
            high_resolution: bits & 0x80 != 0,
            executing: bits & 0x40 != 0,
            destination_reached: bits & 0x20 != 0,
            soft_limit_override: bits & 0x10 != 0,
            moving_cw: bits & 0x08 != 0,
            moving_ccw: bits & 0x04 != 0,
            moving_up: bits & 0x02 != 0,
            moving_down: bits & 0x01 != 0,
        }
    }

    /// Either axis is moving.
    pub fn is_moving(&self) -> bool {
        self.moving_cw || self.moving_ccw || self.moving_up || self.moving_down
    }
}

/// Soft limits in degrees, indexed CW, CCW, UP, DOWN.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SoftLimits {
    /// Pan clockwise limit.
    pub cw: f64,
    /// Pan counter-clockwise limit.
    pub ccw: f64,
    /// Tilt upper limit.
    pub up: f64,
    /// Tilt lower limit.
    pub down: f64,
}

/// Everything the positioner has told us so far.
///
/// Only the status parser writes to this.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PositionerStatus {
    /// Raw position from the last status reply.
    #[serde(skip)]
    pub position: Coordinate,
    /// Pan axis faults.
    pub pan_faults: AxisFaults,
    /// Tilt axis faults.
    pub tilt_faults: AxisFaults,
    /// General status bits.
    pub motion: MotionFlags,
    /// Device-side angle correction.
    #[serde(skip)]
    pub angle_correction: Coordinate,
    /// Programmed soft limits.
    pub soft_limits: SoftLimits,
    /// Potentiometer center readings.
    #[serde(skip)]
    pub center_position: Coordinate,
    /// Minimum `(pan, tilt)` speeds.
    pub min_speeds: (u8, u8),
    /// Maximum `(pan, tilt)` speeds.
    pub max_speeds: (u8, u8),
    /// Communication timeout; 0 when disabled.
    pub comm_timeout_secs: u8,
}

impl PositionerStatus {
    /// Calibrated pan, degrees.
    pub fn pan(&self, calibration: &PositionerCalibration) -> f64 {
        self.position.pan_degrees(calibration)
    }

    /// Calibrated tilt, degrees.
    pub fn tilt(&self, calibration: &PositionerCalibration) -> f64 {
        self.position.tilt_degrees(calibration)
    }

    /// A hard fault is latched on either axis.
    pub fn has_hard_fault(&self) -> bool {
        self.pan_faults.any_hard_fault() || self.tilt_faults.any_hard_fault()
    }
}
