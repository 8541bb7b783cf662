//! Far-field sweep orchestration.
//!
//! - [`config`]: validated sweep parameters built from operator settings
//! - [`timing`]: analyzer delay table and continuous-sweep speed planning
//! - [`control`]: pause/resume/stop flags and cancellable delays
//! - [`runner`]: the sweep state machine
//! - [`actor`]: command-driven front for the runner
//!
//! # Example
//!
//! ```rust,ignore
//! use farfield_daq::experiment::{SweepRunner, SweepTiming, TimingTable};
//!
//! let mut runner = SweepRunner::new(positioner.handle(), SweepTiming::default(), TimingTable::default());
//! let mut events = runner.subscribe();
//! runner.start(config, vna, Box::new(CsvSink::create(path)?)).await?;
//! while let Ok(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! ```

pub mod actor;
pub mod config;
pub mod control;
pub mod runner;
pub mod timing;

pub use actor::{InstrumentConnector, SweepManagerActor, VisaConnector};
pub use config::{MovementMode, SweepAxis, SweepConfig};
pub use control::{cancellable_delay, CancelToken, SweepControlFlags};
pub use runner::{SweepRunner, SweepState, SweepTiming};
pub use timing::{
    continuous_plan, AxisSpeedLaw, ContinuousPlan, DelayRow, TimingTable, VnaDelays,
    PAN_SPEED_LAW, TILT_SPEED_LAW,
};
