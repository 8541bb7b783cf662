//! QPT pan/tilt positioner.
//!
//! Layered bottom-up:
//!
//! - [`integer`]: 16-bit wire integers, coordinates and read-time calibration
//! - [`packet`]: frame encoding, escaping, LRC and the command set
//! - [`parser`]: applies reply frames to a [`PositionerStatus`]
//! - [`driver`]: request/response exchanges over one transport
//! - [`controller`]: background task that owns the driver and serializes
//!   every caller through a priority queue

pub mod controller;
pub mod driver;
pub mod integer;
pub mod packet;
pub mod parser;
pub mod status;

pub use controller::{
    CommandBuffer, ControllerSettings, PositionTelemetry, PositionerCommand, PositionerController,
    PositionerHandle,
};
pub use driver::{DriverTiming, JogDirection, MoveMode, QptDriver, SharedPosition, SoftLimitSetup};
pub use integer::{Coordinate, PositionerCalibration, WireInt};
pub use packet::{DecodedFrame, LimitAxis};
pub use status::{AxisFaults, MotionFlags, PositionerStatus, SoftLimits};
