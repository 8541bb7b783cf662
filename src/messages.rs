//! Message types for actor-based communication
//!
//! This module defines the commands a front end sends to the
//! [`SweepManagerActor`](crate::experiment::actor::SweepManagerActor), and the
//! typed events the positioner controller and sweep runner publish. Events go
//! out over broadcast channels so any number of listeners (a GUI, the CLI
//! progress printer, a test harness) can subscribe without the producers
//! knowing who is listening.

use crate::error::AppResult;
use crate::experiment::{SweepConfig, SweepState};
use std::path::PathBuf;
use tokio::sync::oneshot;

/// Published by the positioner controller.
#[derive(Debug, Clone, PartialEq)]
pub enum PositionerEvent {
    /// Link is up and the first status has been read.
    Connected,
    /// Display-formatted angles, two decimals.
    Position {
        /// Pan angle.
        pan: String,
        /// Tilt angle.
        tilt: String,
    },
    /// A command failed; the text is operator-facing.
    Error(String),
    /// Link closed.
    Disconnected,
}

/// Calibration standards, in the order they are measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CalibrationStage {
    /// Open-circuit standard.
    Open,
    /// Short-circuit standard.
    Short,
    /// Matched load.
    Load,
}

impl CalibrationStage {
    /// Every stage, in measurement order.
    pub const ALL: [CalibrationStage; 3] = [
        CalibrationStage::Open,
        CalibrationStage::Short,
        CalibrationStage::Load,
    ];

    /// Zero-based position in [`Self::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }

    /// Operator prompt for this stage.
    pub fn prompt(self) -> &'static str {
        match self {
            CalibrationStage::Open => "Connect the OPEN standard to port 1",
            CalibrationStage::Short => "Connect the SHORT standard to port 1",
            CalibrationStage::Load => "Connect the LOAD standard to port 1",
        }
    }
}

/// Published by the sweep runner.
#[derive(Debug, Clone, PartialEq)]
pub enum SweepEvent {
    /// The runner moved to a new state.
    StateChanged(SweepState),
    /// Percent complete, 0..=100.
    Progress(u8),
    /// Analyzer configured and positioner at the start angle.
    SetupComplete,
    /// Waiting for [`SweepCommand::ProceedCalibration`] for this stage.
    CalibrationReady(CalibrationStage),
    /// Paused between points.
    RunPaused,
    /// Ended early by a stop.
    RunStopped,
    /// Every point measured.
    RunComplete,
    /// The sweep aborted with this message.
    Error(String),
}

/// Commands that can be sent to the sweep manager actor.
#[derive(Debug)]
pub enum SweepCommand {
    /// Start a new sweep writing to `output`.
    Start {
        /// Sweep parameters.
        config: Box<SweepConfig>,
        /// CSV file to create.
        output: PathBuf,
        /// Reply once the sweep is spawned.
        response: oneshot::Sender<AppResult<()>>,
    },
    /// Pause a running sweep.
    Pause {
        /// Reply channel.
        response: oneshot::Sender<AppResult<()>>,
    },
    /// Resume a paused sweep.
    Resume {
        /// Reply channel.
        response: oneshot::Sender<AppResult<()>>,
    },
    /// Stop the sweep and close its file.
    Stop {
        /// Reply channel.
        response: oneshot::Sender<AppResult<()>>,
    },
    /// Operator has fitted the standard for `stage`.
    ProceedCalibration {
        /// Stage the operator is confirming.
        stage: CalibrationStage,
        /// Reply channel.
        response: oneshot::Sender<AppResult<()>>,
    },
    /// Read the current sweep state.
    GetState {
        /// Reply channel.
        response: oneshot::Sender<SweepState>,
    },
    /// Stop any running sweep and exit the actor.
    Shutdown {
        /// Signalled after the actor has cleaned up.
        response: oneshot::Sender<()>,
    },
}

impl SweepCommand {
    /// Build a start command and its reply receiver.
    pub fn start(config: SweepConfig, output: PathBuf) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::Start {
                config: Box::new(config),
                output,
                response: tx,
            },
            rx,
        )
    }

    /// Build a pause command.
    pub fn pause() -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Pause { response: tx }, rx)
    }

    /// Build a resume command.
    pub fn resume() -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Resume { response: tx }, rx)
    }

    /// Build a stop command.
    pub fn stop() -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Stop { response: tx }, rx)
    }

    /// Build a calibration confirmation for `stage`.
    pub fn proceed_calibration(
        stage: CalibrationStage,
    ) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::ProceedCalibration {
                stage,
                response: tx,
            },
            rx,
        )
    }

    /// Build a state query.
    pub fn get_state() -> (Self, oneshot::Receiver<SweepState>) {
        let (tx, rx) = oneshot::channel();
        (Self::GetState { response: tx }, rx)
    }

    /// Build a shutdown command.
    pub fn shutdown() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}
