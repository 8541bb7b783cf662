//! Fixed-point values carried on the QPT wire.
//!
//! Every numeric field in a QPT frame is a 16-bit two's-complement integer sent
//! little-endian. Angles are sent as hundredths of a degree, so a pair of these
//! words describes a full pan/tilt coordinate.

use crate::error::CodecError;

/// Hundredths of a degree per wire unit.
pub const ANGLE_SCALE: f64 = 100.0;

/// Pan travel, raw degrees.
pub const PAN_MIN: f64 = -180.0;
/// Upper end of pan travel.
pub const PAN_MAX: f64 = 180.0;
/// Tilt travel, raw degrees.
pub const TILT_MIN: f64 = -90.0;
/// Upper end of tilt travel.
pub const TILT_MAX: f64 = 90.0;

/// A signed 16-bit wire integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WireInt(i16);

impl WireInt {
    /// Build from any integer, rejecting values outside `[-32768, 32767]`.
    pub fn new(value: i64) -> Result<Self, CodecError> {
        i16::try_from(value)
            .map(Self)
            .map_err(|_| CodecError::IntegerOutOfRange(value))
    }

    /// Decode two little-endian bytes. Always valid.
    pub fn from_le_bytes(bytes: [u8; 2]) -> Self {
        Self(i16::from_le_bytes(bytes))
    }

    /// Read a word at `offset`; `None` if the slice is too short.
    pub fn read(bytes: &[u8], offset: usize) -> Option<Self> {
        let lo = *bytes.get(offset)?;
        let hi = *bytes.get(offset + 1)?;
        Some(Self::from_le_bytes([lo, hi]))
    }

    /// Wire bytes, little-endian.
    pub fn to_le_bytes(self) -> [u8; 2] {
        self.0.to_le_bytes()
    }

    /// The integer carried.
    pub fn value(self) -> i16 {
        self.0
    }
}

/// Read-time offsets applied to positioner angles.
///
/// The positioner always reports raw angles; the offsets turn them into the
/// operator's frame of reference (`angle = raw + offset`). Because the offsets
/// move the whole frame, the permitted range moves with them: a pan offset of
/// 10° makes `[-170°, 190°]` the valid pan range.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PositionerCalibration {
    /// Added to the raw pan angle.
    pub pan_offset: f64,
    /// Added to the raw tilt angle.
    pub tilt_offset: f64,
}

impl PositionerCalibration {
    /// Offsets in degrees.
    pub fn new(pan_offset: f64, tilt_offset: f64) -> Self {
        Self {
            pan_offset,
            tilt_offset,
        }
    }

    /// Permitted pan range after the offset.
    pub fn pan_bounds(&self) -> (f64, f64) {
        (PAN_MIN + self.pan_offset, PAN_MAX + self.pan_offset)
    }

    /// Permitted tilt range after the offset.
    pub fn tilt_bounds(&self) -> (f64, f64) {
        (TILT_MIN + self.tilt_offset, TILT_MAX + self.tilt_offset)
    }
}

/// A pan/tilt pair in wire representation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Coordinate {
    pan: i16,
    tilt: i16,
}

impl Coordinate {
    /// Build from angles in the calibrated frame.
    ///
    /// # Errors
    ///
    /// [`CodecError::AngleOutOfRange`] if either angle falls outside the
    /// calibrated bounds.
    pub fn from_degrees(
        pan: f64,
        tilt: f64,
        calibration: &PositionerCalibration,
    ) -> Result<Self, CodecError> {
        let (pan_min, pan_max) = calibration.pan_bounds();
        let (tilt_min, tilt_max) = calibration.tilt_bounds();
        check_range("pan", pan, pan_min, pan_max)?;
        check_range("tilt", tilt, tilt_min, tilt_max)?;
        Ok(Self {
            pan: to_raw(pan - calibration.pan_offset)?,
            tilt: to_raw(tilt - calibration.tilt_offset)?,
        })
    }

    /// Build from a relative move. Deltas are only bounded by the wire range.
    pub fn delta(pan: f64, tilt: f64) -> Result<Self, CodecError> {
        Ok(Self {
            pan: to_raw(pan)?,
            tilt: to_raw(tilt)?,
        })
    }

    /// Build from the four wire bytes (pan then tilt). The positioner firmware
    /// does not range-check what it reports, so neither do we.
    pub fn from_wire(bytes: [u8; 4]) -> Self {
        Self {
            pan: i16::from_le_bytes([bytes[0], bytes[1]]),
            tilt: i16::from_le_bytes([bytes[2], bytes[3]]),
        }
    }

    /// Read a coordinate starting at `offset`.
    pub fn read(bytes: &[u8], offset: usize) -> Option<Self> {
        let slice = bytes.get(offset..offset + 4)?;
        Some(Self::from_wire([slice[0], slice[1], slice[2], slice[3]]))
    }

    /// Pan word then tilt word.
    pub fn to_wire(self) -> [u8; 4] {
        let [p0, p1] = self.pan.to_le_bytes();
        let [t0, t1] = self.tilt.to_le_bytes();
        [p0, p1, t0, t1]
    }

    /// Pan in wire units.
    pub fn pan_raw(self) -> i16 {
        self.pan
    }

    /// Tilt in wire units.
    pub fn tilt_raw(self) -> i16 {
        self.tilt
    }

    /// Calibrated pan, degrees.
    pub fn pan_degrees(self, calibration: &PositionerCalibration) -> f64 {
        f64::from(self.pan) / ANGLE_SCALE + calibration.pan_offset
    }

    /// Calibrated tilt, degrees.
    pub fn tilt_degrees(self, calibration: &PositionerCalibration) -> f64 {
        f64::from(self.tilt) / ANGLE_SCALE + calibration.tilt_offset
    }
}

fn check_range(axis: &'static str, value: f64, min: f64, max: f64) -> Result<(), CodecError> {
    if !value.is_finite() || value < min || value > max {
        return Err(CodecError::AngleOutOfRange {
            axis,
            value,
            min,
            max,
        });
    }
    Ok(())
}

fn to_raw(degrees: f64) -> Result<i16, CodecError> {
    let scaled = (degrees * ANGLE_SCALE).round();
    if !scaled.is_finite() {
        return Err(CodecError::IntegerOutOfRange(i64::MAX));
    }
    WireInt::new(scaled as i64).map(WireInt::value)
}
