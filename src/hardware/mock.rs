//! Simulated QPT positioner
//!
//! Answers QPT frames the way the firmware does, without hardware. Motion is
//! advanced one tick per received frame so tests are deterministic regardless of
//! wall-clock timing:
//!
//! - Absolute/delta/zero moves approach the target by `move_step` degrees per tick
//! - Jogs move by `speed * jog_scale` degrees per tick until stopped or a limit is hit
//! - Angles are clamped to the mechanical range (pan ±180°, tilt ±90°)
//!
//! Clones share state, so a test can keep one clone for inspection while a
//! driver owns the other.

use crate::adapters::PositionerTransport;
use crate::hardware::qpt::integer::{Coordinate, PAN_MAX, PAN_MIN, TILT_MAX, TILT_MIN};
use crate::hardware::qpt::packet::{self, cmd, DecodedFrame};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Motion {
    Idle,
    Target { pan: f64, tilt: f64 },
    Jog { pan_rate: f64, tilt_rate: f64 },
}

#[derive(Debug)]
struct SimState {
    pan: f64,
    tilt: f64,
    motion: Motion,
    move_step: f64,
    jog_scale: f64,
    correction: Coordinate,
    soft_limits: [i16; 4],
    center: Coordinate,
    min_speeds: (u8, u8),
    max_speeds: (u8, u8),
    comm_timeout: u8,
    received: Vec<DecodedFrame>,
    replies: VecDeque<Vec<u8>>,
    drop_replies: u32,
    fail_writes: bool,
}

/// Simulated positioner implementing [`PositionerTransport`].
#[derive(Clone)]
pub struct SimulatedQpt {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedQpt {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedQpt {
    /// Positioner at 0/0, moving 5° per tick.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                pan: 0.0,
                tilt: 0.0,
                motion: Motion::Idle,
                move_step: 5.0,
                jog_scale: 0.1,
                correction: Coordinate::default(),
                soft_limits: [18000, -18000, 9000, -9000],
                center: Coordinate::default(),
                min_speeds: (0, 0),
                max_speeds: (127, 127),
                comm_timeout: 0,
                received: Vec::new(),
                replies: VecDeque::new(),
                drop_replies: 0,
                fail_writes: false,
            })),
        }
    }

    /// Degrees covered per tick by absolute/delta/zero moves.
    pub fn with_move_step(self, degrees: f64) -> Self {
        self.lock().move_step = degrees;
        self
    }

    /// Degrees per tick per unit of jog speed.
    pub fn with_jog_scale(self, scale: f64) -> Self {
        self.lock().jog_scale = scale;
        self
    }

    /// Start at `pan`/`tilt` degrees.
    pub fn with_position(self, pan: f64, tilt: f64) -> Self {
        {
            let mut state = self.lock();
            state.pan = pan;
            state.tilt = tilt;
        }
        self
    }

    /// Swallow the next `count` replies, as a disconnected or noisy line would.
    pub fn drop_next_replies(&self, count: u32) {
        self.lock().drop_replies = count;
    }

    /// Make every write fail until cleared.
    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// Current `(pan, tilt)` in degrees.
    pub fn position(&self) -> (f64, f64) {
        let state = self.lock();
        (state.pan, state.tilt)
    }

    /// Whether a move or jog is in progress.
    pub fn is_moving(&self) -> bool {
        self.lock().motion != Motion::Idle
    }

    /// Every frame received so far, decoded.
    pub fn received(&self) -> Vec<DecodedFrame> {
        self.lock().received.clone()
    }

    /// Command bytes received so far.
    pub fn received_commands(&self) -> Vec<u8> {
        self.lock().received.iter().map(|f| f.command).collect()
    }

    /// Forget the frames received so far.
    pub fn clear_log(&self) {
        self.lock().received.clear();
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SimState {
    fn tick(&mut self) {
        match self.motion {
            Motion::Idle => {}
            Motion::Target { pan, tilt } => {
                self.pan = approach(self.pan, pan, self.move_step);
                self.tilt = approach(self.tilt, tilt, self.move_step);
                if self.pan == pan && self.tilt == tilt {
                    self.motion = Motion::Idle;
                }
            }
            Motion::Jog {
                pan_rate,
                tilt_rate,
            } => {
                self.pan = (self.pan + pan_rate).clamp(PAN_MIN, PAN_MAX);
                self.tilt = (self.tilt + tilt_rate).clamp(TILT_MIN, TILT_MAX);
                let pan_stuck = pan_rate == 0.0 || self.pan == PAN_MIN || self.pan == PAN_MAX;
                let tilt_stuck =
                    tilt_rate == 0.0 || self.tilt == TILT_MIN || self.tilt == TILT_MAX;
                if pan_stuck && tilt_stuck {
                    self.motion = Motion::Idle;
                }
            }
        }
    }

    fn raw_position(&self) -> Coordinate {
        Coordinate::from_wire(encode_coordinate(self.pan, self.tilt))
    }

    fn motion_reply(&self, command: u8) -> Vec<u8> {
        let mut general = 0u8;
        match self.motion {
            Motion::Idle => general |= 0x20,
            Motion::Target { pan, tilt } => {
                general |= 0x40;
                general |= direction_bits(pan - self.pan, tilt - self.tilt);
            }
            Motion::Jog {
                pan_rate,
                tilt_rate,
            } => {
                general |= 0x40;
                general |= direction_bits(pan_rate, tilt_rate);
            }
        }
        let pan_bits = limit_bits(self.pan, PAN_MIN, PAN_MAX);
        let tilt_bits = limit_bits(self.tilt, TILT_MIN, TILT_MAX);

        let mut payload = self.raw_position().to_wire().to_vec();
        payload.extend_from_slice(&[pan_bits, tilt_bits, general]);
        packet::encode(command, &payload)
    }

    fn handle(&mut self, frame: &DecodedFrame) -> Option<Vec<u8>> {
        let p = &frame.payload;
        let reply = match frame.command {
            cmd::GET_STATUS_JOG => {
                let flags = *p.first()?;
                let pan_byte = *p.get(1)?;
                let tilt_byte = *p.get(2)?;
                if flags & 0x02 != 0 {
                    self.motion = Motion::Idle;
                } else if pan_byte != 0 || tilt_byte != 0 {
                    let pan_rate = jog_rate(pan_byte, self.jog_scale);
                    let tilt_rate = jog_rate(tilt_byte, self.jog_scale);
                    self.motion = Motion::Jog {
                        pan_rate,
                        tilt_rate,
                    };
                }
                self.tick();
                self.motion_reply(cmd::GET_STATUS_JOG)
            }
            cmd::MOVE_TO_COORDS => {
                let target = Coordinate::read(p, 0)?;
                self.motion = Motion::Target {
                    pan: f64::from(target.pan_raw()) / 100.0,
                    tilt: f64::from(target.tilt_raw()) / 100.0,
                };
                self.motion_reply(cmd::MOVE_TO_COORDS)
            }
            cmd::MOVE_TO_DELTA => {
                let delta = Coordinate::read(p, 0)?;
                self.motion = Motion::Target {
                    pan: (self.pan + f64::from(delta.pan_raw()) / 100.0).clamp(PAN_MIN, PAN_MAX),
                    tilt: (self.tilt + f64::from(delta.tilt_raw()) / 100.0)
                        .clamp(TILT_MIN, TILT_MAX),
                };
                self.motion_reply(cmd::MOVE_TO_DELTA)
            }
            cmd::MOVE_TO_ZERO => {
                self.motion = Motion::Target {
                    pan: 0.0,
                    tilt: 0.0,
                };
                self.motion_reply(cmd::MOVE_TO_ZERO)
            }
            cmd::GET_ANGLE_CORRECTION => packet::encode(frame.command, &self.correction.to_wire()),
            cmd::SET_ANGLE_CORRECTION => {
                self.correction = Coordinate::read(p, 0)?;
                packet::encode(frame.command, &self.correction.to_wire())
            }
            cmd::ALIGN_ANGLES_TO_CENTER => {
                self.correction = self.raw_position();
                self.pan = 0.0;
                self.tilt = 0.0;
                packet::encode(frame.command, &self.correction.to_wire())
            }
            cmd::CLEAR_ANGLE_CORRECTION => {
                self.pan += f64::from(self.correction.pan_raw()) / 100.0;
                self.tilt += f64::from(self.correction.tilt_raw()) / 100.0;
                self.correction = Coordinate::default();
                packet::encode(frame.command, &self.correction.to_wire())
            }
            cmd::GET_SOFT_LIMIT | cmd::SET_SOFT_LIMIT => {
                let axis = *p.first()?;
                let slot = self.soft_limits.get_mut(usize::from(axis))?;
                if frame.command == cmd::SET_SOFT_LIMIT {
                    let current = if axis < 2 { self.pan } else { self.tilt };
                    *slot = (current * 100.0).round() as i16;
                }
                let mut payload = vec![axis];
                payload.extend_from_slice(&slot.to_le_bytes());
                packet::encode(frame.command, &payload)
            }
            cmd::GET_CENTER_POSITION => packet::encode(frame.command, &self.center.to_wire()),
            cmd::SET_CENTER_POSITION => {
                self.center = self.raw_position();
                packet::encode(frame.command, &self.center.to_wire())
            }
            cmd::GET_MIN_SPEEDS => {
                packet::encode(frame.command, &[self.min_speeds.0, self.min_speeds.1])
            }
            cmd::SET_MIN_SPEEDS => {
                self.min_speeds = (*p.first()?, *p.get(1)?);
                packet::encode(frame.command, &[self.min_speeds.0, self.min_speeds.1])
            }
            cmd::GET_MAX_SPEEDS => {
                packet::encode(frame.command, &[self.max_speeds.0, self.max_speeds.1])
            }
            cmd::SET_MAX_SPEEDS => {
                self.max_speeds = (*p.first()?, *p.get(1)?);
                packet::encode(frame.command, &[self.max_speeds.0, self.max_speeds.1])
            }
            cmd::COMM_TIMEOUT => {
                let value = *p.first()?;
                if value & 0x80 == 0 {
                    self.comm_timeout = value;
                }
                packet::encode(frame.command, &[self.comm_timeout])
            }
            _ => return None,
        };
        // Moves keep running between frames.
        if frame.command != cmd::GET_STATUS_JOG {
            self.tick();
        }
        Some(reply)
    }
}

fn approach(current: f64, target: f64, step: f64) -> f64 {
    if (target - current).abs() <= step {
        target
    } else if target > current {
        current + step
    } else {
        current - step
    }
}

fn jog_rate(byte: u8, scale: f64) -> f64 {
    let speed = f64::from(byte >> 1);
    if byte & 0x01 != 0 {
        speed * scale
    } else {
        -speed * scale
    }
}

fn direction_bits(pan: f64, tilt: f64) -> u8 {
    let mut bits = 0;
    if pan > 0.0 {
        bits |= 0x08;
    } else if pan < 0.0 {
        bits |= 0x04;
    }
    if tilt > 0.0 {
        bits |= 0x02;
    } else if tilt < 0.0 {
        bits |= 0x01;
    }
    bits
}

fn limit_bits(angle: f64, min: f64, max: f64) -> u8 {
    let mut bits = 0;
    if angle >= max {
        bits |= 0x20;
    }
    if angle <= min {
        bits |= 0x10;
    }
    bits
}

fn encode_coordinate(pan: f64, tilt: f64) -> [u8; 4] {
    let pan = (pan * 100.0).round() as i16;
    let tilt = (tilt * 100.0).round() as i16;
    let [p0, p1] = pan.to_le_bytes();
    let [t0, t1] = tilt.to_le_bytes();
    [p0, p1, t0, t1]
}

#[async_trait]
impl PositionerTransport for SimulatedQpt {
    async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        let mut state = self.lock();
        if state.fail_writes {
            return Err(anyhow!("simulated write failure"));
        }
        let decoded = packet::decode(frame).map_err(|e| anyhow!("simulated positioner: {e}"))?;
        if !decoded.lrc_valid {
            return Ok(());
        }
        let reply = state.handle(&decoded);
        state.received.push(decoded);
        if let Some(reply) = reply {
            if state.drop_replies > 0 {
                state.drop_replies -= 1;
            } else {
                state.replies.push_back(reply);
            }
        }
        Ok(())
    }

    async fn read_frame(&mut self, _timeout: Duration) -> Result<Option<Vec<u8>>> {
        Ok(self.lock().replies.pop_front())
    }

    async fn clear_input(&mut self) -> Result<()> {
        self.lock().replies.clear();
        Ok(())
    }
}
