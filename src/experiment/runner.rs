//! Sweep state machine.
//!
//! ```text
//! NotRunning ──start──> SetupRunning ──> Running ──pause──> Paused
//!      ▲                     ▲                                 │
//!      │                     └────────────resume───────────────┘
//!      └── complete / stop / error
//! ```
//!
//! Each start or resume spawns one run task. The task owns the analyzer
//! session and the sample sink; when it pauses it hands them back to the
//! [`SweepRunner`] together with the next step to measure, so a resumed run
//! never re-measures a position.
//!
//! The run loop never talks to the positioner directly. Moves and jogs go
//! through the positioner controller's queue and positions are read from its
//! telemetry.
//!
//! Poll points, in order, after every recorded step:
//! 1. completion (progress reached 100)
//! 2. stop
//! 3. pause

use super::config::{MovementMode, SweepAxis, SweepConfig};
use super::control::{cancellable_delay, CancelToken, SweepControlFlags};
use super::timing::{continuous_plan, ContinuousPlan, TimingTable, VnaDelays};
use crate::error::{AppResult, DaqError};
use crate::hardware::qpt::{
    JogDirection, MoveMode, PositionTelemetry, PositionerCommand, PositionerHandle,
};
use crate::instrument::VnaSession;
use crate::measurement::{MeasurementKind, SampleSink};
use crate::messages::{CalibrationStage, SweepEvent};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lifecycle of the sweep controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SweepState {
    /// Idle. Also reached after completion, stop or error.
    NotRunning,
    /// Configuring the analyzer, calibrating or parking the positioner.
    SetupRunning,
    /// Recording positions.
    Running,
    /// Parked between steps, waiting for resume or stop.
    Paused,
}

impl fmt::Display for SweepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SweepState::NotRunning => write!(f, "NotRunning"),
            SweepState::SetupRunning => write!(f, "SetupRunning"),
            SweepState::Running => write!(f, "Running"),
            SweepState::Paused => write!(f, "Paused"),
        }
    }
}

impl SweepState {
    /// A new sweep may start.
    pub fn can_start(&self) -> bool {
        matches!(self, SweepState::NotRunning)
    }

    /// A pause request would be honoured.
    pub fn can_pause(&self) -> bool {
        matches!(self, SweepState::SetupRunning | SweepState::Running)
    }

    /// There is a paused sweep to resume.
    pub fn can_resume(&self) -> bool {
        matches!(self, SweepState::Paused)
    }
}

/// Waits and caps used by the run loop.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepTiming {
    /// Period of every position and calibration poll.
    pub poll_interval: Duration,
    /// Period between jog commands in a continuous sweep.
    pub jog_interval: Duration,
    /// Polls allowed for a move between steps.
    pub move_polls: u32,
    /// Polls allowed for the initial move to the start angle.
    pub setup_polls: u32,
    /// Degrees within which a position counts as reached.
    pub tolerance: f64,
    /// IF bandwidth programmed into the analyzer, Hz.
    pub if_bandwidth: u32,
}

impl Default for SweepTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            jog_interval: Duration::from_millis(120),
            move_polls: 25,
            setup_polls: 300,
            tolerance: 0.1,
            if_bandwidth: 3700,
        }
    }
}

/// Everything a run needs that survives a pause.
struct SweepJob {
    config: SweepConfig,
    vna: VnaSession,
    sink: Box<dyn SampleSink>,
    delays: VnaDelays,
    /// May differ from `config.movement` when continuous was not feasible.
    movement: MovementMode,
    jog_speed: u8,
    /// 1-based step measured next.
    next_step: u32,
    setup_done: bool,
}

enum RunOutcome {
    Finished,
    Paused(Box<SweepJob>),
}

/// How a run left the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Complete,
    Stopped,
    Paused,
}

/// How a wait that a stop can cut short ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Waited {
    /// Settled, timed out or ran its full delay.
    Done,
    Cancelled,
}

impl Waited {
    fn from_delay(completed: bool) -> Self {
        if completed {
            Waited::Done
        } else {
            Waited::Cancelled
        }
    }
}

/// State shared by the runner and its run task.
struct RunContext {
    positioner: PositionerHandle,
    flags: Arc<SweepControlFlags>,
    timing: SweepTiming,
    table: TimingTable,
    state: watch::Sender<SweepState>,
    events: broadcast::Sender<SweepEvent>,
}

impl RunContext {
    fn emit(&self, event: SweepEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: SweepState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!(from = %previous, to = %state, "Sweep state changed");
            self.emit(SweepEvent::StateChanged(state));
        }
    }

    /// A cut-short wait caused by a stop. Nothing may be recorded after it.
    fn stopped(&self, waited: Waited) -> bool {
        waited == Waited::Cancelled && self.flags.stop_requested()
    }

    fn axis_angle(axis: SweepAxis, telemetry: &PositionTelemetry) -> f64 {
        match axis {
            SweepAxis::Pan => telemetry.pan,
            SweepAxis::Tilt => telemetry.tilt,
        }
    }

    /// Queue an absolute move to `swept` on the sweep axis and wait for it.
    async fn move_to(
        &self,
        config: &SweepConfig,
        swept: f64,
        polls: u32,
        cancel: &CancelToken,
    ) -> AppResult<Waited> {
        let (pan, tilt) = config.position_for(swept);
        self.positioner.enqueue(PositionerCommand::MoveTo {
            pan,
            tilt,
            mode: MoveMode::Absolute,
        })?;

        for _ in 0..polls {
            if !cancellable_delay(self.timing.poll_interval, cancel).await {
                return Ok(Waited::Cancelled);
            }
            let now = self.positioner.position();
            let error = (Self::axis_angle(config.axis, &now) - swept).abs();
            if !now.moving && error <= self.timing.tolerance {
                return Ok(Waited::Done);
            }
        }
        warn!(target_angle = swept, polls, "Positioner did not settle, measuring anyway");
        Ok(Waited::Done)
    }

    /// Wait until a jogging axis has passed `swept`.
    async fn wait_until_past(&self, axis: SweepAxis, swept: f64, cancel: &CancelToken) -> Waited {
        for _ in 0..self.timing.move_polls {
            let now = self.positioner.position();
            if Self::axis_angle(axis, &now) >= swept - self.timing.tolerance {
                return Waited::Done;
            }
            if !cancellable_delay(self.timing.poll_interval, cancel).await {
                return Waited::Cancelled;
            }
        }
        warn!(target_angle = swept, "Jog fell behind the measurement schedule");
        Waited::Done
    }

    /// Restart averaging, let it settle and record one trace.
    ///
    /// A stop during the averaging delay leaves the trace unrecorded.
    async fn measure(
        &self,
        job: &mut SweepJob,
        kind: MeasurementKind,
        cancel: &CancelToken,
    ) -> AppResult<Waited> {
        job.vna.rst_avg(kind).await?;
        let waited = Waited::from_delay(cancellable_delay(job.delays.avg_duration(), cancel).await);
        if self.stopped(waited) {
            return Ok(Waited::Cancelled);
        }
        record(job, &self.positioner, kind).await?;
        Ok(Waited::Done)
    }

    /// Emit progress and check the poll points. `None` means carry on.
    fn after_step(&self, job: &mut SweepJob, step: u32) -> Option<Exit> {
        let progress = job.config.progress(step);
        self.emit(SweepEvent::Progress(progress));
        if progress >= 100 {
            return Some(Exit::Complete);
        }
        if self.flags.stop_requested() {
            return Some(Exit::Stopped);
        }
        if self.flags.take_pause() {
            job.next_step = step + 1;
            return Some(Exit::Paused);
        }
        None
    }

    /// Gate each calibration stage on the operator. `false` if stopped.
    async fn calibrate(&self, job: &mut SweepJob, cancel: &CancelToken) -> AppResult<bool> {
        for stage in CalibrationStage::ALL {
            self.emit(SweepEvent::CalibrationReady(stage));
            info!(?stage, "Waiting for calibration standard");
            while !self.flags.may_proceed(stage) {
                if self.flags.stop_requested() {
                    return Ok(false);
                }
                cancellable_delay(self.timing.poll_interval, cancel).await;
            }
            match stage {
                CalibrationStage::Open => job.vna.calibrate_open().await?,
                CalibrationStage::Short => job.vna.calibrate_short().await?,
                CalibrationStage::Load => job.vna.calibrate_load().await?,
            }
        }
        Ok(true)
    }

    /// Prepare analyzer and positioner. `false` if a stop arrived meanwhile.
    async fn setup(&self, job: &mut SweepJob, cancel: &CancelToken) -> AppResult<bool> {
        if job.config.calibration {
            job.vna.reset_all().await?;
            if !self.calibrate(job, cancel).await? {
                return Ok(false);
            }
        } else {
            job.vna.reset().await?;
        }

        job.vna
            .setup(
                &job.config.frequencies,
                job.config.averaging,
                self.timing.if_bandwidth,
            )
            .await?;
        job.delays = self.table.delays(&job.config.frequencies, job.config.averaging);

        if job.movement == MovementMode::Continuous {
            match continuous_plan(job.config.axis, &job.delays, job.config.total_steps()) {
                ContinuousPlan::Jog { speed, total_time } => {
                    info!(speed, total_time, "Continuous sweep planned");
                    job.jog_speed = speed;
                }
                ContinuousPlan::TooSlow { total_time, budget } => {
                    warn!(
                        total_time,
                        budget, "Continuous sweep exceeds the axis time budget, stepping instead"
                    );
                    job.movement = MovementMode::Step;
                    job.jog_speed = 0;
                }
            }
        }

        let start = job.config.start_angle();
        let waited = self
            .move_to(&job.config, start, self.timing.setup_polls, cancel)
            .await?;
        if self.stopped(waited) || self.flags.stop_requested() {
            return Ok(false);
        }

        if job.config.impedance {
            let waited = self.measure(job, MeasurementKind::S11, cancel).await?;
            if self.stopped(waited) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn step_loop(
        &self,
        job: &mut SweepJob,
        resuming: bool,
        cancel: &CancelToken,
    ) -> AppResult<Exit> {
        let total = job.config.total_steps();
        // Setup already parked the positioner on the first angle.
        let mut needs_move = resuming;
        let mut step = job.next_step;
        while step <= total {
            if needs_move {
                let target = job.config.target(step);
                let waited = self
                    .move_to(&job.config, target, self.timing.move_polls, cancel)
                    .await?;
                if self.stopped(waited) {
                    return Ok(Exit::Stopped);
                }
            }
            needs_move = true;

            let waited = self.measure(job, MeasurementKind::S21, cancel).await?;
            if self.stopped(waited) {
                return Ok(Exit::Stopped);
            }
            if let Some(exit) = self.after_step(job, step) {
                return Ok(exit);
            }
            step += 1;
        }
        Ok(Exit::Complete)
    }

    async fn continuous_loop(
        self: &Arc<Self>,
        job: &mut SweepJob,
        cancel: &CancelToken,
    ) -> AppResult<Exit> {
        self.flags.release_jog();
        let mut jogger: Option<JoinHandle<()>> = None;
        let result = self.continuous_steps(job, &mut jogger, cancel).await;

        if let Some(handle) = jogger {
            self.flags.halt_jog();
            if let Err(e) = handle.await {
                warn!(error = %e, "Jog sender task failed");
            }
            if let Err(e) = self.positioner.enqueue(PositionerCommand::Stop) {
                warn!(error = %e, "Could not stop the positioner after jogging");
            }
        }
        result
    }

    async fn continuous_steps(
        self: &Arc<Self>,
        job: &mut SweepJob,
        jogger: &mut Option<JoinHandle<()>>,
        cancel: &CancelToken,
    ) -> AppResult<Exit> {
        let total = job.config.total_steps();
        let axis = job.config.axis;
        let mut step = job.next_step;
        while step <= total {
            let target = job.config.target(step);
            job.vna.rst_avg(MeasurementKind::S21).await?;
            let mut waited =
                Waited::from_delay(cancellable_delay(job.delays.avg_duration(), cancel).await);
            if waited == Waited::Done && jogger.is_some() {
                waited = self.wait_until_past(axis, target, cancel).await;
            }
            if self.stopped(waited) {
                return Ok(Exit::Stopped);
            }
            record(job, &self.positioner, MeasurementKind::S21).await?;

            if let Some(exit) = self.after_step(job, step) {
                return Ok(exit);
            }
            if jogger.is_none() {
                *jogger = Some(tokio::spawn(send_jogs(
                    Arc::clone(self),
                    axis,
                    job.jog_speed,
                )));
            }
            step += 1;
        }
        Ok(Exit::Complete)
    }

    async fn drive(
        self: &Arc<Self>,
        job: &mut SweepJob,
        resuming: bool,
        cancel: &CancelToken,
    ) -> AppResult<Exit> {
        if !job.setup_done {
            if !self.setup(job, cancel).await? {
                return Ok(Exit::Stopped);
            }
            job.setup_done = true;
        }

        // A stop or pause that arrived during setup.
        if self.flags.stop_requested() {
            return Ok(Exit::Stopped);
        }
        if self.flags.take_pause() {
            return Ok(Exit::Paused);
        }

        self.emit(SweepEvent::SetupComplete);
        self.set_state(SweepState::Running);
        info!(
            axis = %job.config.axis,
            movement = %job.movement,
            from_step = job.next_step,
            total_steps = job.config.total_steps(),
            "Sweep running"
        );
        match job.movement {
            MovementMode::Step => self.step_loop(job, resuming, cancel).await,
            MovementMode::Continuous => self.continuous_loop(job, cancel).await,
        }
    }
}

/// Read the current trace into the sink.
///
/// S21 traces are tagged with the current position (theta is tilt, phi is
/// pan). The S11 trace is position independent and tagged with zeros.
async fn record(
    job: &mut SweepJob,
    positioner: &PositionerHandle,
    kind: MeasurementKind,
) -> AppResult<()> {
    let (theta, phi) = match kind {
        MeasurementKind::S21 => {
            let at = positioner.position();
            (at.tilt, at.pan)
        }
        MeasurementKind::S11 => (0.0, 0.0),
    };
    let samples = job.vna.get_data(theta, phi, kind).await?;
    job.sink
        .write(&samples)
        .await
        .map_err(|e| DaqError::Sweep(format!("failed to write samples: {e:#}")))?;
    debug!(%kind, rows = samples.len(), "Trace recorded");
    Ok(())
}

/// Keep the sweep axis jogging toward its upper end until halted.
async fn send_jogs(ctx: Arc<RunContext>, axis: SweepAxis, speed: u8) {
    let (direction, extreme) = match axis {
        SweepAxis::Pan => (JogDirection::Cw, axis.extreme()),
        SweepAxis::Tilt => (JogDirection::Up, axis.extreme()),
    };
    debug!(%axis, speed, "Jog sender started");
    while !ctx.flags.jog_halted() {
        let now = ctx.positioner.position();
        if RunContext::axis_angle(axis, &now) >= extreme {
            break;
        }
        let jog = PositionerCommand::Jog {
            direction,
            speed,
            target: extreme,
        };
        if let Err(e) = ctx.positioner.enqueue(jog) {
            warn!(error = %e, "Jog sender stopping");
            break;
        }
        tokio::time::sleep(ctx.timing.jog_interval).await;
    }
    debug!("Jog sender finished");
}

async fn finish(ctx: &RunContext, job: &mut SweepJob, exit: Exit) {
    if exit == Exit::Stopped {
        ctx.emit(SweepEvent::Progress(0));
    }
    if let Err(e) = job.sink.terminate().await {
        error!(error = %e, "Failed to terminate measurement file");
        ctx.emit(SweepEvent::Error(format!("{e:#}")));
    }
    match exit {
        Exit::Stopped => {
            info!("Sweep stopped");
            ctx.emit(SweepEvent::RunStopped);
        }
        _ => {
            info!("Sweep complete");
            ctx.emit(SweepEvent::RunComplete);
        }
    }
    ctx.set_state(SweepState::NotRunning);
}

async fn run_task(ctx: Arc<RunContext>, mut job: Box<SweepJob>, cancel: CancelToken) -> RunOutcome {
    let resuming = ctx.flags.take_resume();
    let result = ctx.drive(&mut job, resuming, &cancel).await;
    match result {
        Ok(Exit::Paused) => {
            ctx.set_state(SweepState::Paused);
            ctx.emit(SweepEvent::RunPaused);
            info!(next_step = job.next_step, "Sweep paused");
            RunOutcome::Paused(job)
        }
        Ok(exit) => {
            finish(&ctx, &mut job, exit).await;
            RunOutcome::Finished
        }
        Err(e) => {
            error!(error = %e, "Sweep aborted");
            ctx.emit(SweepEvent::Error(e.to_string()));
            // Readers of the file treat an aborted sweep like a stopped one.
            if let Err(e) = job.sink.terminate().await {
                warn!(error = %e, "Failed to terminate measurement file");
            }
            ctx.set_state(SweepState::NotRunning);
            RunOutcome::Finished
        }
    }
}

/// Front-end facing sweep controller.
pub struct SweepRunner {
    ctx: Arc<RunContext>,
    cancel: CancelToken,
    task: Option<JoinHandle<RunOutcome>>,
    parked: Option<Box<SweepJob>>,
}

impl SweepRunner {
    /// Idle runner driving `positioner`.
    pub fn new(positioner: PositionerHandle, timing: SweepTiming, table: TimingTable) -> Self {
        let (state, _) = watch::channel(SweepState::NotRunning);
        let (events, _) = broadcast::channel(1024);
        Self {
            ctx: Arc::new(RunContext {
                positioner,
                flags: Arc::new(SweepControlFlags::new()),
                timing,
                table,
                state,
                events,
            }),
            cancel: CancelToken::new(),
            task: None,
            parked: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> SweepState {
        *self.ctx.state.borrow()
    }

    /// Receiver that sees every state change.
    pub fn watch_state(&self) -> watch::Receiver<SweepState> {
        self.ctx.state.subscribe()
    }

    /// Receiver for progress and lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<SweepEvent> {
        self.ctx.events.subscribe()
    }

    /// Shared control flags.
    pub fn flags(&self) -> Arc<SweepControlFlags> {
        Arc::clone(&self.ctx.flags)
    }

    /// Begin a sweep with an opened analyzer session and a fresh sink.
    ///
    /// # Errors
    /// - [`DaqError::Sweep`] unless the runner is `NotRunning`
    /// - [`DaqError::PositionerNotConnected`] if the positioner link is down
    pub async fn start(
        &mut self,
        config: SweepConfig,
        vna: VnaSession,
        sink: Box<dyn SampleSink>,
    ) -> AppResult<()> {
        let state = self.state();
        if !state.can_start() {
            return Err(DaqError::Sweep(format!("cannot start a sweep while {state}")));
        }
        // The previous run has already left the loop; collect it.
        self.reap().await?;
        config.validate()?;
        if !self.ctx.positioner.is_connected() {
            return Err(DaqError::PositionerNotConnected);
        }

        self.parked = None;
        self.ctx.flags.reset();
        self.cancel = CancelToken::new();
        let job = Box::new(SweepJob {
            movement: config.movement,
            config,
            vna,
            sink,
            delays: VnaDelays {
                avg: 0.0,
                s11: 0.0,
                s21: 0.0,
            },
            jog_speed: 0,
            next_step: 1,
            setup_done: false,
        });
        self.ctx.set_state(SweepState::SetupRunning);
        self.task = Some(tokio::spawn(run_task(
            Arc::clone(&self.ctx),
            job,
            self.cancel.clone(),
        )));
        Ok(())
    }

    /// Ask the running sweep to pause at its next poll point.
    pub fn pause(&self) -> AppResult<()> {
        let state = self.state();
        if !state.can_pause() {
            return Err(DaqError::Sweep(format!("cannot pause while {state}")));
        }
        self.ctx.flags.request_pause();
        Ok(())
    }

    /// Continue a paused sweep at the step after the last one recorded.
    pub async fn resume(&mut self) -> AppResult<()> {
        let state = self.state();
        if !state.can_resume() {
            return Err(DaqError::Sweep(format!("cannot resume while {state}")));
        }
        if !self.ctx.positioner.is_connected() {
            return Err(DaqError::PositionerNotConnected);
        }
        self.reap().await?;
        let job = self
            .parked
            .take()
            .ok_or_else(|| DaqError::Sweep("no paused sweep to resume".to_string()))?;

        self.ctx.flags.request_resume();
        self.ctx.set_state(SweepState::SetupRunning);
        self.task = Some(tokio::spawn(run_task(
            Arc::clone(&self.ctx),
            job,
            self.cancel.clone(),
        )));
        Ok(())
    }

    /// Stop the sweep.
    ///
    /// A running sweep stops at its next poll point. A paused sweep is closed
    /// out immediately.
    pub async fn stop(&mut self) -> AppResult<()> {
        match self.state() {
            SweepState::NotRunning => Err(DaqError::Sweep("no sweep to stop".to_string())),
            SweepState::Paused => {
                self.reap().await?;
                if let Some(mut job) = self.parked.take() {
                    finish(&self.ctx, &mut job, Exit::Stopped).await;
                } else {
                    self.ctx.set_state(SweepState::NotRunning);
                }
                Ok(())
            }
            SweepState::SetupRunning | SweepState::Running => {
                self.ctx.flags.request_stop();
                self.cancel.cancel();
                Ok(())
            }
        }
    }

    /// Let the run task through the calibration gate for `stage`.
    pub fn proceed_calibration(&self, stage: CalibrationStage) -> AppResult<()> {
        if self.state() != SweepState::SetupRunning {
            return Err(DaqError::Sweep(format!(
                "calibration is only possible during setup, not while {}",
                self.state()
            )));
        }
        self.ctx.flags.proceed(stage);
        Ok(())
    }

    /// Wait for the current run task to finish or pause.
    pub async fn wait(&mut self) -> AppResult<()> {
        self.reap().await
    }

    /// Collect the run task, keeping a paused job for later.
    async fn reap(&mut self) -> AppResult<()> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        match task.await {
            Ok(RunOutcome::Paused(job)) => {
                self.parked = Some(job);
                Ok(())
            }
            Ok(RunOutcome::Finished) => Ok(()),
            Err(e) => {
                self.ctx.set_state(SweepState::NotRunning);
                Err(DaqError::Sweep(format!("sweep task failed: {e}")))
            }
        }
    }
}
