//! QPT positioner driver.
//!
//! One driver owns one physical connection and the [`PositionerStatus`] learned
//! over it. Every exchange is half-duplex: wait the inter-frame gap, write a
//! frame, then read one reply terminated by ETX within a short timeout. A missing
//! reply is not an error here; it simply leaves the status unchanged.
//!
//! Only the owning task mutates the status. The current position is also
//! published through a lock so other tasks can take consistent snapshots.
//!
//! # Example Usage
//!
//! ```no_run
//! use farfield_daq::adapters::SerialTransport;
//! use farfield_daq::hardware::qpt::{DriverTiming, MoveMode, QptDriver};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let transport = SerialTransport::open("/dev/ttyUSB0", 9600)?;
//! let mut driver = QptDriver::new(Box::new(transport), DriverTiming::default());
//! if driver.connect().await? {
//!     driver.move_to(45.0, 0.0, MoveMode::Absolute).await?;
//!     println!("pan = {:.2}", driver.pan());
//! }
//! # Ok(())
//! # }
//! ```

use super::integer::{Coordinate, PositionerCalibration};
use super::packet::{self, JogRequest, LimitAxis, PanDirection, TiltDirection};
use super::parser;
use super::status::PositionerStatus;
use crate::adapters::PositionerTransport;
use crate::config::PositionerConfig;
use crate::error::{AppResult, DaqError};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Minimum-speed floor used for moves, high enough that the firmware does not
/// flag a timeout while accelerating.
const MOVE_MIN_SPEEDS: (u8, u8) = (50, 50);
/// Minimum-speed floor used for jogs, low enough for slow continuous sweeps.
const JOG_MIN_SPEEDS: (u8, u8) = (8, 17);

/// Latest position, readable from any task.
pub type SharedPosition = Arc<RwLock<Coordinate>>;

/// Exchange timing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriverTiming {
    /// How long to wait for a reply frame.
    pub exchange_timeout: Duration,
    /// Gap enforced before every write.
    pub inter_frame_delay: Duration,
    /// Pause after a move before and after the status refresh.
    pub settle_delay: Duration,
    /// Status queries attempted while establishing the link.
    pub connect_retries: u32,
}

impl Default for DriverTiming {
    fn default() -> Self {
        Self {
            exchange_timeout: Duration::from_millis(30),
            inter_frame_delay: Duration::from_millis(20),
            settle_delay: Duration::from_millis(120),
            connect_retries: 25,
        }
    }
}

impl From<&PositionerConfig> for DriverTiming {
    fn from(config: &PositionerConfig) -> Self {
        Self {
            exchange_timeout: Duration::from_millis(config.exchange_timeout_ms),
            inter_frame_delay: Duration::from_millis(config.inter_frame_delay_ms),
            settle_delay: Duration::from_millis(config.settle_delay_ms),
            connect_retries: config.connect_retries,
        }
    }
}

/// Kind of move requested from [`QptDriver::move_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveMode {
    /// Go to the given angles.
    Absolute,
    /// Move by the given angles.
    Delta,
    /// Go to 0/0.
    Zero,
    /// Halt both axes.
    Stop,
}

/// Axis and sense of a jog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JogDirection {
    /// Pan clockwise.
    Cw,
    /// Pan counter-clockwise.
    Ccw,
    /// Tilt up.
    Up,
    /// Tilt down.
    Down,
}

impl JogDirection {
    fn request(self, speed: u8) -> JogRequest {
        match self {
            JogDirection::Cw => JogRequest::pan(speed, PanDirection::Cw),
            JogDirection::Ccw => JogRequest::pan(speed, PanDirection::Ccw),
            JogDirection::Up => JogRequest::tilt(speed, TiltDirection::Up),
            JogDirection::Down => JogRequest::tilt(speed, TiltDirection::Down),
        }
    }
}

/// Driver for one QPT positioner connection.
pub struct QptDriver {
    transport: Box<dyn PositionerTransport>,
    status: PositionerStatus,
    position: SharedPosition,
    calibration: PositionerCalibration,
    timing: DriverTiming,
    connected: bool,
}

impl QptDriver {
    /// Driver over `transport`. Nothing is sent until [`connect`](Self::connect).
    pub fn new(transport: Box<dyn PositionerTransport>, timing: DriverTiming) -> Self {
        Self {
            transport,
            status: PositionerStatus::default(),
            position: Arc::new(RwLock::new(Coordinate::default())),
            calibration: PositionerCalibration::default(),
            timing,
            connected: false,
        }
    }

    /// Decode positions with `calibration`.
    pub fn with_calibration(mut self, calibration: PositionerCalibration) -> Self {
        self.calibration = calibration;
        self
    }

    /// Confirm the link by polling status until a well-formed reply arrives.
    ///
    /// Returns whether the positioner answered within the retry budget.
    pub async fn connect(&mut self) -> AppResult<bool> {
        for attempt in 1..=self.timing.connect_retries {
            match self.query(&packet::get_status()).await {
                Ok(true) => {
                    info!(attempt, "Positioner link established");
                    self.connected = true;
                    return Ok(true);
                }
                Ok(false) => debug!(attempt, "No status reply from positioner"),
                Err(e) => warn!(attempt, error = %e, "Positioner status exchange failed"),
            }
        }
        warn!(
            retries = self.timing.connect_retries,
            "Positioner did not answer"
        );
        self.connected = false;
        Ok(false)
    }

    /// Whether [`connect`](Self::connect) got a valid reply.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Status as of the last valid reply.
    pub fn status(&self) -> &PositionerStatus {
        &self.status
    }

    /// Offsets used to decode positions.
    pub fn calibration(&self) -> PositionerCalibration {
        self.calibration
    }

    /// Replace the decoding offsets.
    pub fn set_calibration(&mut self, calibration: PositionerCalibration) {
        self.calibration = calibration;
    }

    /// Locked snapshot of the current position.
    pub fn get_position(&self) -> Coordinate {
        *self
            .position
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Handle for reading the position from other tasks.
    pub fn position_handle(&self) -> SharedPosition {
        Arc::clone(&self.position)
    }

    /// Calibrated pan, degrees.
    pub fn pan(&self) -> f64 {
        self.get_position().pan_degrees(&self.calibration)
    }

    /// Calibrated tilt, degrees.
    pub fn tilt(&self) -> f64 {
        self.get_position().tilt_degrees(&self.calibration)
    }

    async fn exchange(&mut self, frame: &[u8]) -> AppResult<Option<Vec<u8>>> {
        tokio::time::sleep(self.timing.inter_frame_delay).await;
        self.transport.clear_input().await?;
        self.transport.write_frame(frame).await?;
        Ok(self
            .transport
            .read_frame(self.timing.exchange_timeout)
            .await?)
    }

    /// Send `frame` and apply whatever comes back. Returns whether a valid
    /// reply updated the status.
    async fn query(&mut self, frame: &[u8]) -> AppResult<bool> {
        let reply = self.exchange(frame).await?;
        let applied = parser::parse(reply.as_deref(), &mut self.status);
        if applied {
            let mut position = self
                .position
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *position = self.status.position;
        }
        Ok(applied)
    }

    /// Re-query status.
    pub async fn get_status(&mut self) -> AppResult<bool> {
        self.query(&packet::get_status()).await
    }

    /// Move, then refresh status once the positioner has had time to react.
    ///
    /// `pan`/`tilt` are ignored for [`MoveMode::Zero`] and [`MoveMode::Stop`].
    pub async fn move_to(&mut self, pan: f64, tilt: f64, mode: MoveMode) -> AppResult<()> {
        let frame = match mode {
            MoveMode::Absolute => {
                packet::move_to_coords(Coordinate::from_degrees(pan, tilt, &self.calibration)?)
            }
            MoveMode::Delta => packet::move_to_delta(Coordinate::delta(pan, tilt)?),
            MoveMode::Zero => packet::move_to_zero(),
            MoveMode::Stop => packet::stop(),
        };
        debug!(?mode, pan, tilt, "Positioner move");

        self.query(&packet::set_min_speeds(MOVE_MIN_SPEEDS.0, MOVE_MIN_SPEEDS.1))
            .await?;
        self.query(&frame).await?;
        tokio::time::sleep(self.timing.settle_delay).await;
        self.get_status().await?;
        tokio::time::sleep(self.timing.settle_delay).await;
        Ok(())
    }

    /// Jog toward `target` (degrees along the jogged axis), or stop if the
    /// axis is already there.
    ///
    /// Callers enqueue jogs faster than the positioner covers ground; checking
    /// the target here keeps a racing jog loop from overshooting.
    pub async fn jog(&mut self, direction: JogDirection, speed: u8, target: f64) -> AppResult<()> {
        let frame = packet::jog(&direction.request(speed))?;
        self.query(&packet::set_min_speeds(JOG_MIN_SPEEDS.0, JOG_MIN_SPEEDS.1))
            .await?;

        let short_of_target = match direction {
            JogDirection::Cw => self.pan() < target,
            JogDirection::Ccw => self.pan() > target,
            JogDirection::Up => self.tilt() < target,
            JogDirection::Down => self.tilt() > target,
        };
        if short_of_target {
            self.query(&frame).await?;
        } else {
            debug!(?direction, target, "Jog target reached, stopping");
            self.move_to(0.0, 0.0, MoveMode::Stop).await?;
        }
        Ok(())
    }

    /// Query everything the positioner reports, in a fixed order.
    pub async fn update_all_stats(&mut self) -> AppResult<()> {
        self.get_status().await?;
        self.query(&packet::get_angle_correction()).await?;
        for axis in LimitAxis::ALL {
            self.query(&packet::get_soft_limit(axis)).await?;
        }
        self.query(&packet::get_min_speeds()).await?;
        self.query(&packet::query_comm_timeout()).await?;
        self.query(&packet::get_max_speeds()).await?;
        Ok(())
    }

    /// Clear the device's angle correction and drop any read-time offsets.
    pub async fn clear_offsets(&mut self) -> AppResult<()> {
        self.query(&packet::clear_angle_correction()).await?;
        self.calibration = PositionerCalibration::default();
        self.get_status().await?;
        info!("Positioner offsets cleared");
        Ok(())
    }

    /// Have the device re-reference its angles to the potentiometer center.
    pub async fn align_to_center(&mut self) -> AppResult<()> {
        self.query(&packet::align_angles_to_center()).await?;
        self.get_status().await?;
        info!("Positioner angles aligned to center");
        Ok(())
    }

    /// Clear latched faults.
    pub async fn fault_reset(&mut self) -> AppResult<()> {
        self.query(&packet::fault_reset()).await?;
        Ok(())
    }

    /// Seconds of silence after which the positioner stops on its own. 0 disables.
    pub async fn set_comm_timeout(&mut self, seconds: u8) -> AppResult<()> {
        self.query(&packet::set_comm_timeout(seconds)?).await?;
        Ok(())
    }

    /// Upper speed limits for both axes.
    pub async fn set_max_speeds(&mut self, pan: u8, tilt: u8) -> AppResult<()> {
        self.query(&packet::set_max_speeds(pan, tilt)?).await?;
        Ok(())
    }

    /// Store the current potentiometer readings as center, then read them back.
    pub async fn set_center_position(&mut self) -> AppResult<()> {
        self.query(&packet::set_center_position()).await?;
        self.query(&packet::get_center_position()).await?;
        Ok(())
    }

    /// Enter soft-limit setup. The override jog and limit programming are only
    /// available through the returned guard.
    pub fn soft_limit_setup(&mut self) -> SoftLimitSetup<'_> {
        warn!("Entering soft-limit setup, limits can be overridden");
        SoftLimitSetup { driver: self }
    }

    /// Send a stop and release the link.
    pub async fn shutdown(mut self) -> AppResult<()> {
        let result = self.move_to(0.0, 0.0, MoveMode::Stop).await;
        self.connected = false;
        info!("Positioner connection released");
        result
    }
}

/// Exclusive access to the soft-limit commands.
pub struct SoftLimitSetup<'a> {
    driver: &'a mut QptDriver,
}

impl SoftLimitSetup<'_> {
    /// Jog with soft limits ignored.
    pub async fn jog_overriding_limits(
        &mut self,
        direction: JogDirection,
        speed: u8,
    ) -> AppResult<()> {
        let frame = packet::jog_overriding_soft_limits(&direction.request(speed))?;
        self.driver.query(&frame).await?;
        Ok(())
    }

    /// Program the soft limit for `axis` at the current position.
    pub async fn set_limit_to_current(&mut self, axis: LimitAxis) -> AppResult<f64> {
        if !self
            .driver
            .query(&packet::set_soft_limit_to_current(axis))
            .await?
        {
            return Err(DaqError::Instrument(format!(
                "positioner did not confirm {axis:?} soft limit"
            )));
        }
        let limits = self.driver.status.soft_limits;
        Ok(match axis {
            LimitAxis::Cw => limits.cw,
            LimitAxis::Ccw => limits.ccw,
            LimitAxis::Up => limits.up,
            LimitAxis::Down => limits.down,
        })
    }

    /// Status of the underlying driver.
    pub fn status(&self) -> &PositionerStatus {
        self.driver.status()
    }
}
