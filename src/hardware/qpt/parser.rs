//! Applies received QPT frames to a [`PositionerStatus`].
//!
//! Reply layouts (offsets into the unescaped body, command byte at 0):
//!
//! | Command            | Layout                                                  |
//! |--------------------|---------------------------------------------------------|
//! | 0x31               | pan i16 @1, tilt i16 @3, pan bits @5, tilt bits @6, general @7 |
//! | 0x33 0x34 0x35     | same as 0x31, position ignored (it is the target echo)  |
//! | 0x70 0x80 0x82 0x84| angle correction coordinate @1                          |
//! | 0x71 0x81          | axis @1, limit i16 @2 (hundredths of a degree)          |
//! | 0x90 0x91          | center coordinate @1                                    |
//! | 0x92 0x93          | min pan speed @1, min tilt speed @2                     |
//! | 0x98 0x99          | max pan speed @1, max tilt speed @2                     |
//! | 0x96               | communication timeout @1                                |
//!
//! Noisy lines are expected: anything malformed, short or failing the LRC is
//! dropped and the previous status is kept.

use super::integer::{Coordinate, WireInt, ANGLE_SCALE};
use super::packet::{cmd, lrc, unescaped_body, LimitAxis};
use super::status::{AxisFaults, MotionFlags, PositionerStatus};
use tracing::{trace, warn};

/// Apply `frame` to `status`. Returns whether anything was updated.
pub fn parse(frame: Option<&[u8]>, status: &mut PositionerStatus) -> bool {
    let Some(frame) = frame else {
        return false;
    };
    let body = match unescaped_body(frame) {
        Ok(body) if body.len() >= 2 => body,
        Ok(_) | Err(_) => {
            warn!(len = frame.len(), "Dropping malformed QPT frame");
            return false;
        }
    };
    if lrc(&body) != 0 {
        warn!(command = body[0], "Dropping QPT frame with bad LRC");
        return false;
    }

    let command = body[0];
    let applied = match command {
        cmd::GET_STATUS_JOG | cmd::MOVE_TO_COORDS | cmd::MOVE_TO_DELTA | cmd::MOVE_TO_ZERO => {
            apply_motion_status(&body, command == cmd::GET_STATUS_JOG, status)
        }
        cmd::GET_ANGLE_CORRECTION
        | cmd::SET_ANGLE_CORRECTION
        | cmd::ALIGN_ANGLES_TO_CENTER
        | cmd::CLEAR_ANGLE_CORRECTION => Coordinate::read(&body, 1)
            .map(|c| status.angle_correction = c)
            .is_some(),
        cmd::GET_SOFT_LIMIT | cmd::SET_SOFT_LIMIT => apply_soft_limit(&body, status),
        cmd::GET_CENTER_POSITION | cmd::SET_CENTER_POSITION => Coordinate::read(&body, 1)
            .map(|c| status.center_position = c)
            .is_some(),
        cmd::GET_MIN_SPEEDS | cmd::SET_MIN_SPEEDS => read_pair(&body)
            .map(|pair| status.min_speeds = pair)
            .is_some(),
        cmd::GET_MAX_SPEEDS | cmd::SET_MAX_SPEEDS => read_pair(&body)
            .map(|pair| status.max_speeds = pair)
            .is_some(),
        cmd::COMM_TIMEOUT => body
            .get(1)
            .map(|&secs| status.comm_timeout_secs = secs)
            .is_some(),
        other => {
            trace!(command = other, "Ignoring untracked QPT reply");
            return false;
        }
    };
    if !applied {
        warn!(command, len = body.len(), "QPT reply too short for its command");
    }
    applied
}

fn apply_motion_status(body: &[u8], update_position: bool, status: &mut PositionerStatus) -> bool {
    let (Some(pan_bits), Some(tilt_bits), Some(general)) = (body.get(5), body.get(6), body.get(7))
    else {
        return false;
    };
    if update_position {
        if let Some(position) = Coordinate::read(body, 1) {
            status.position = position;
        }
    }
    status.pan_faults = AxisFaults::from_bits(*pan_bits);
    status.tilt_faults = AxisFaults::from_bits(*tilt_bits);
    status.motion = MotionFlags::from_bits(*general);
    true
}

fn apply_soft_limit(body: &[u8], status: &mut PositionerStatus) -> bool {
    let Some(axis) = body.get(1).copied().and_then(LimitAxis::from_wire) else {
        return false;
    };
    let Some(raw) = WireInt::read(body, 2) else {
        return false;
    };
    let degrees = f64::from(raw.value()) / ANGLE_SCALE;
    match axis {
        LimitAxis::Cw => status.soft_limits.cw = degrees,
        LimitAxis::Ccw => status.soft_limits.ccw = degrees,
        LimitAxis::Up => status.soft_limits.up = degrees,
        LimitAxis::Down => status.soft_limits.down = degrees,
    }
    true
}

fn read_pair(body: &[u8]) -> Option<(u8, u8)> {
    Some((*body.get(1)?, *body.get(2)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::qpt::packet::encode;
    use crate::hardware::qpt::PositionerCalibration;

    fn status_reply(pan: i16, tilt: i16, pan_bits: u8, tilt_bits: u8, general: u8) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&pan.to_le_bytes());
        payload.extend_from_slice(&tilt.to_le_bytes());
        payload.extend_from_slice(&[pan_bits, tilt_bits, general]);
        encode(cmd::GET_STATUS_JOG, &payload)
    }

    #[test]
    fn status_reply_updates_position_and_bits() {
        let mut status = PositionerStatus::default();
        let frame = status_reply(-4500, 1250, 0x80, 0x08, 0x48);
        assert!(parse(Some(&frame), &mut status));

        let cal = PositionerCalibration::default();
        assert!((status.pan(&cal) + 45.0).abs() < 1e-9);
        assert!((status.tilt(&cal) - 12.5).abs() < 1e-9);
        assert!(status.pan_faults.forward_soft_limit);
        assert!(status.tilt_faults.timeout);
        assert!(status.motion.executing);
        assert!(status.motion.moving_cw);
    }

    #[test]
    fn move_echo_keeps_position() {
        let mut status = PositionerStatus::default();
        parse(Some(&status_reply(100, 200, 0, 0, 0)), &mut status);

        let mut payload = vec![0x10, 0x27, 0x00, 0x00, 0x00, 0x00, 0x20];
        payload.extend_from_slice(&[0, 0]);
        let frame = encode(cmd::MOVE_TO_COORDS, &payload);
        assert!(parse(Some(&frame), &mut status));
        assert_eq!(status.position.pan_raw(), 100);
        assert!(status.motion.destination_reached);
    }

    #[test]
    fn bad_lrc_leaves_status_untouched() {
        let mut status = PositionerStatus::default();
        let mut frame = status_reply(1000, 0, 0, 0, 0);
        let lrc_index = frame.len() - 2;
        frame[lrc_index] ^= 0x40;
        assert!(!parse(Some(&frame), &mut status));
        assert_eq!(status, PositionerStatus::default());
    }

    #[test]
    fn none_and_garbage_are_noops() {
        let mut status = PositionerStatus::default();
        assert!(!parse(None, &mut status));
        assert!(!parse(Some(&[0x02]), &mut status));
        assert!(!parse(Some(&[0x31, 0x00, 0x03]), &mut status));
        assert_eq!(status, PositionerStatus::default());
    }

    #[test]
    fn soft_limit_reply() {
        let mut status = PositionerStatus::default();
        let frame = encode(cmd::GET_SOFT_LIMIT, &[2, 0x28, 0x23]);
        assert!(parse(Some(&frame), &mut status));
        assert!((status.soft_limits.up - 90.0).abs() < 1e-9);

        let frame = encode(cmd::SET_SOFT_LIMIT, &[1, 0xb0, 0xb9]);
        assert!(parse(Some(&frame), &mut status));
        assert!((status.soft_limits.ccw + 180.0).abs() < 1e-9);
    }

    #[test]
    fn speeds_timeout_center_and_correction() {
        let mut status = PositionerStatus::default();
        assert!(parse(Some(&encode(cmd::GET_MIN_SPEEDS, &[8, 17])), &mut status));
        assert!(parse(Some(&encode(cmd::SET_MAX_SPEEDS, &[127, 100])), &mut status));
        assert!(parse(Some(&encode(cmd::COMM_TIMEOUT, &[30])), &mut status));
        assert!(parse(
            Some(&encode(cmd::GET_CENTER_POSITION, &[0x01, 0x02, 0x03, 0x04])),
            &mut status
        ));
        assert!(parse(
            Some(&encode(cmd::ALIGN_ANGLES_TO_CENTER, &[0xe8, 0x03, 0x00, 0x00])),
            &mut status
        ));
        assert_eq!(status.min_speeds, (8, 17));
        assert_eq!(status.max_speeds, (127, 100));
        assert_eq!(status.comm_timeout_secs, 30);
        assert_eq!(status.center_position.pan_raw(), 0x0201);
        assert_eq!(status.angle_correction.pan_raw(), 1000);
    }

    #[test]
    fn unknown_command_is_ignored() {
        let mut status = PositionerStatus::default();
        assert!(!parse(Some(&encode(0x55, &[1, 2, 3])), &mut status));
        assert_eq!(status, PositionerStatus::default());
    }
}
