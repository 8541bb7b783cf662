//! QPT binary frame codec.
//!
//! Protocol overview:
//! - Format: `STX | command | payload... | LRC | ETX`
//! - LRC: XOR of the command byte and every payload byte. A frame is intact when
//!   the XOR over command, payload and LRC is zero.
//! - Escaping: any byte between STX and ETX that collides with a control character
//!   (`STX`, `ETX`, `ACK`, `NAK`, `ESC`) is sent as `ESC, byte | 0x80`. The command
//!   byte is escaped too, although no command currently in use collides.
//! - Multi-byte values: signed 16-bit little-endian, see [`super::integer`].
//!
//! Frames with no variable content are kept as constants in `frames` and
//! checked against the encoder in tests.

use super::integer::Coordinate;
use crate::error::CodecError;

/// Start of frame.
pub const STX: u8 = 0x02;
/// End of frame.
pub const ETX: u8 = 0x03;
/// Acknowledge. Reserved, always escaped.
pub const ACK: u8 = 0x06;
/// Negative acknowledge. Reserved, always escaped.
pub const NAK: u8 = 0x15;
/// Escape prefix.
pub const ESC: u8 = 0x1b;

const ESCAPE_BIT: u8 = 0x80;
const CONTROL_CHARS: [u8; 5] = [STX, ETX, ACK, NAK, ESC];

/// Command bytes understood by the positioner.
pub mod cmd {
    /// Status query, jog, stop and fault reset, told apart by the first payload byte.
    pub const GET_STATUS_JOG: u8 = 0x31;
    /// Absolute move.
    pub const MOVE_TO_COORDS: u8 = 0x33;
    /// Relative move.
    pub const MOVE_TO_DELTA: u8 = 0x34;
    /// Move to 0/0.
    pub const MOVE_TO_ZERO: u8 = 0x35;
    /// Read the device angle correction.
    pub const GET_ANGLE_CORRECTION: u8 = 0x70;
    /// Read one soft limit.
    pub const GET_SOFT_LIMIT: u8 = 0x71;
    /// Write the device angle correction.
    pub const SET_ANGLE_CORRECTION: u8 = 0x80;
    /// Set one soft limit to the current position.
    pub const SET_SOFT_LIMIT: u8 = 0x81;
    /// Align the angles to the potentiometer center.
    pub const ALIGN_ANGLES_TO_CENTER: u8 = 0x82;
    /// Clear the device angle correction.
    pub const CLEAR_ANGLE_CORRECTION: u8 = 0x84;
    /// Read the potentiometer center.
    pub const GET_CENTER_POSITION: u8 = 0x90;
    /// Store the current potentiometer readings as center.
    pub const SET_CENTER_POSITION: u8 = 0x91;
    /// Read the minimum speeds.
    pub const GET_MIN_SPEEDS: u8 = 0x92;
    /// Write the minimum speeds.
    pub const SET_MIN_SPEEDS: u8 = 0x93;
    /// Set or, with payload 0x80, query the communication timeout.
    pub const COMM_TIMEOUT: u8 = 0x96;
    /// Read the maximum speeds.
    pub const GET_MAX_SPEEDS: u8 = 0x98;
    /// Write the maximum speeds.
    pub const SET_MAX_SPEEDS: u8 = 0x99;
}

/// Pre-computed frames.
mod frames {
    pub const GET_STATUS: &[u8] = &[0x02, 0x31, 0x00, 0x00, 0x00, 0x00, 0x00, 0x31, 0x03];
    pub const STOP: &[u8] = &[0x02, 0x31, 0x1b, 0x82, 0x00, 0x00, 0x00, 0x00, 0x33, 0x03];
    pub const FAULT_RESET: &[u8] = &[0x02, 0x31, 0x01, 0x00, 0x00, 0x00, 0x00, 0x30, 0x03];
    pub const MOVE_TO_ZERO: &[u8] = &[0x02, 0x35, 0x35, 0x03];
    pub const GET_ANGLE_CORRECTION: &[u8] = &[0x02, 0x70, 0x70, 0x03];
    pub const ALIGN_ANGLES_TO_CENTER: &[u8] = &[0x02, 0x82, 0x82, 0x03];
    pub const CLEAR_ANGLE_CORRECTION: &[u8] = &[0x02, 0x84, 0x84, 0x03];
    pub const GET_CENTER_POSITION: &[u8] = &[0x02, 0x90, 0x90, 0x03];
    pub const SET_CENTER_POSITION: &[u8] = &[0x02, 0x91, 0x91, 0x03];
    pub const GET_MIN_SPEEDS: &[u8] = &[0x02, 0x92, 0x92, 0x03];
    pub const GET_MAX_SPEEDS: &[u8] = &[0x02, 0x98, 0x98, 0x03];
}

/// Leading byte of a 0x31 payload.
const JOG_FLAG_FAULT_RESET: u8 = 0x01;
const JOG_FLAG_STOP: u8 = 0x02;
const JOG_FLAG_OVERRIDE_SOFT_LIMIT: u8 = 0x04;

const COMM_TIMEOUT_QUERY: u8 = 0x80;

/// Fastest jog speed; the speed shares its byte with the direction bit.
pub const MAX_JOG_SPEED: u8 = 127;
/// Longest communication timeout the positioner accepts.
pub const MAX_COMM_TIMEOUT_SECS: u8 = 120;

/// XOR of every byte.
pub fn lrc(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// Escape every control character in `bytes`.
pub fn escape(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len() + 2);
    for &b in bytes {
        if CONTROL_CHARS.contains(&b) {
            out.push(ESC);
            out.push(b | ESCAPE_BIT);
        } else {
            out.push(b);
        }
    }
    out
}

/// Undo [`escape`].
pub fn unescape(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut iter = bytes.iter();
    while let Some(&b) = iter.next() {
        if b == ESC {
            // A trailing ESC has nothing to modify and is dropped.
            if let Some(&next) = iter.next() {
                out.push(next & !ESCAPE_BIT);
            }
        } else {
            out.push(b);
        }
    }
    out
}

/// Build a complete frame ready for the wire.
pub fn encode(command: u8, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(payload.len() + 2);
    body.push(command);
    body.extend_from_slice(payload);
    body.push(lrc(&body));

    let mut frame = Vec::with_capacity(body.len() + 4);
    frame.push(STX);
    frame.extend(escape(&body));
    frame.push(ETX);
    frame
}

/// Result of decoding a received frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    /// Command byte.
    pub command: u8,
    /// Payload without the LRC.
    pub payload: Vec<u8>,
    /// Whether the checksum matched.
    pub lrc_valid: bool,
}

/// Decode a frame delimited by STX/ETX.
///
/// # Errors
///
/// [`CodecError::MissingDelimiter`] if the frame is not wrapped in STX/ETX and
/// [`CodecError::Truncated`] if nothing but the delimiters and one byte remain.
/// A bad checksum is not an error; it is reported through `lrc_valid`.
pub fn decode(bytes: &[u8]) -> Result<DecodedFrame, CodecError> {
    let body = unescaped_body(bytes)?;
    let (command, rest) = body
        .split_first()
        .ok_or(CodecError::Truncated(bytes.len()))?;
    let (_, payload) = rest.split_last().ok_or(CodecError::Truncated(bytes.len()))?;
    Ok(DecodedFrame {
        command: *command,
        payload: payload.to_vec(),
        lrc_valid: lrc(&body) == 0,
    })
}

/// Strip the delimiters and undo escaping, leaving `command | payload | LRC`.
pub(crate) fn unescaped_body(bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    match bytes {
        [STX, inner @ .., ETX] => Ok(unescape(inner)),
        [_, _, ..] => Err(CodecError::MissingDelimiter),
        _ => Err(CodecError::Truncated(bytes.len())),
    }
}

fn check_arg(name: &'static str, value: u8, min: u8, max: u8) -> Result<(), CodecError> {
    if value < min || value > max {
        return Err(CodecError::InvalidArgument {
            name,
            value: i64::from(value),
            min: i64::from(min),
            max: i64::from(max),
        });
    }
    Ok(())
}

/// Jog direction along each axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanDirection {
    /// Counter-clockwise.
    Ccw = 0,
    /// Clockwise.
    Cw = 1,
}

/// Jog direction of the tilt axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TiltDirection {
    /// Down.
    Down = 0,
    /// Up.
    Up = 1,
}

/// Soft-limit slots held by the positioner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum LimitAxis {
    /// Clockwise pan limit.
    Cw = 0,
    /// Counter-clockwise pan limit.
    Ccw = 1,
    /// Upper tilt limit.
    Up = 2,
    /// Lower tilt limit.
    Down = 3,
}

impl LimitAxis {
    /// Every slot in wire order.
    pub const ALL: [LimitAxis; 4] = [LimitAxis::Cw, LimitAxis::Ccw, LimitAxis::Up, LimitAxis::Down];

    /// Slot for a wire index.
    pub fn from_wire(byte: u8) -> Option<Self> {
        Self::ALL.get(usize::from(byte)).copied()
    }
}

/// Payload of a 0x31 jog request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JogRequest {
    /// 0 to [`MAX_JOG_SPEED`].
    pub pan_speed: u8,
    /// Pan sense.
    pub pan_direction: PanDirection,
    /// 0 to [`MAX_JOG_SPEED`].
    pub tilt_speed: u8,
    /// Tilt sense.
    pub tilt_direction: TiltDirection,
}

impl JogRequest {
    /// Jog pan only.
    pub fn pan(speed: u8, direction: PanDirection) -> Self {
        Self {
            pan_speed: speed,
            pan_direction: direction,
            tilt_speed: 0,
            tilt_direction: TiltDirection::Down,
        }
    }

    /// Jog tilt only.
    pub fn tilt(speed: u8, direction: TiltDirection) -> Self {
        Self {
            pan_speed: 0,
            pan_direction: PanDirection::Ccw,
            tilt_speed: speed,
            tilt_direction: direction,
        }
    }

    fn payload(&self, flags: u8) -> Result<[u8; 5], CodecError> {
        check_arg("pan_speed", self.pan_speed, 0, MAX_JOG_SPEED)?;
        check_arg("tilt_speed", self.tilt_speed, 0, MAX_JOG_SPEED)?;
        Ok([
            flags,
            (self.pan_speed << 1) | self.pan_direction as u8,
            (self.tilt_speed << 1) | self.tilt_direction as u8,
            0,
            0,
        ])
    }
}

/// Status query.
pub fn get_status() -> Vec<u8> {
    frames::GET_STATUS.to_vec()
}

/// Halt both axes.
pub fn stop() -> Vec<u8> {
    frames::STOP.to_vec()
}

/// Clears latched timeout, direction and overload faults.
pub fn fault_reset() -> Vec<u8> {
    frames::FAULT_RESET.to_vec()
}

/// Jog request within soft limits.
pub fn jog(request: &JogRequest) -> Result<Vec<u8>, CodecError> {
    Ok(encode(cmd::GET_STATUS_JOG, &request.payload(0)?))
}

/// Jog with soft limits ignored. Only reachable through
/// [`super::driver::SoftLimitSetup`].
pub(crate) fn jog_overriding_soft_limits(request: &JogRequest) -> Result<Vec<u8>, CodecError> {
    Ok(encode(
        cmd::GET_STATUS_JOG,
        &request.payload(JOG_FLAG_OVERRIDE_SOFT_LIMIT)?,
    ))
}

/// Absolute move to `target`.
pub fn move_to_coords(target: Coordinate) -> Vec<u8> {
    encode(cmd::MOVE_TO_COORDS, &target.to_wire())
}

/// Relative move by `delta`.
pub fn move_to_delta(delta: Coordinate) -> Vec<u8> {
    encode(cmd::MOVE_TO_DELTA, &delta.to_wire())
}

/// Move to 0/0.
pub fn move_to_zero() -> Vec<u8> {
    frames::MOVE_TO_ZERO.to_vec()
}

/// Read the device angle correction.
pub fn get_angle_correction() -> Vec<u8> {
    frames::GET_ANGLE_CORRECTION.to_vec()
}

/// Write the device angle correction.
pub fn set_angle_correction(correction: Coordinate) -> Vec<u8> {
    encode(cmd::SET_ANGLE_CORRECTION, &correction.to_wire())
}

/// Read the soft limit of `axis`.
pub fn get_soft_limit(axis: LimitAxis) -> Vec<u8> {
    encode(cmd::GET_SOFT_LIMIT, &[axis as u8])
}

pub(crate) fn set_soft_limit_to_current(axis: LimitAxis) -> Vec<u8> {
    encode(cmd::SET_SOFT_LIMIT, &[axis as u8])
}

/// Align angles to the potentiometer center.
pub fn align_angles_to_center() -> Vec<u8> {
    frames::ALIGN_ANGLES_TO_CENTER.to_vec()
}

/// Clear the device angle correction.
pub fn clear_angle_correction() -> Vec<u8> {
    frames::CLEAR_ANGLE_CORRECTION.to_vec()
}

/// Read the potentiometer center.
pub fn get_center_position() -> Vec<u8> {
    frames::GET_CENTER_POSITION.to_vec()
}

/// Store the current potentiometer readings as center.
pub fn set_center_position() -> Vec<u8> {
    frames::SET_CENTER_POSITION.to_vec()
}

/// Read the minimum speeds.
pub fn get_min_speeds() -> Vec<u8> {
    frames::GET_MIN_SPEEDS.to_vec()
}

/// Write the minimum `(pan, tilt)` speeds.
pub fn set_min_speeds(pan: u8, tilt: u8) -> Vec<u8> {
    encode(cmd::SET_MIN_SPEEDS, &[pan, tilt])
}

/// Ask for the communication timeout.
pub fn query_comm_timeout() -> Vec<u8> {
    encode(cmd::COMM_TIMEOUT, &[COMM_TIMEOUT_QUERY])
}

/// Set the communication timeout, 0 to [`MAX_COMM_TIMEOUT_SECS`] seconds.
pub fn set_comm_timeout(seconds: u8) -> Result<Vec<u8>, CodecError> {
    check_arg("comm_timeout", seconds, 0, MAX_COMM_TIMEOUT_SECS)?;
    Ok(encode(cmd::COMM_TIMEOUT, &[seconds]))
}

/// Read the maximum speeds.
pub fn get_max_speeds() -> Vec<u8> {
    frames::GET_MAX_SPEEDS.to_vec()
}

/// Write the maximum speeds, 1 to 255 each.
pub fn set_max_speeds(pan: u8, tilt: u8) -> Result<Vec<u8>, CodecError> {
    check_arg("pan_max_speed", pan, 1, u8::MAX)?;
    check_arg("tilt_max_speed", tilt, 1, u8::MAX)?;
    Ok(encode(cmd::SET_MAX_SPEEDS, &[pan, tilt]))
}
