//! Positioner controller task.
//!
//! A single background task owns the [`QptDriver`] for the lifetime of the
//! connection and is the only code that talks to the serial line. Producers
//! (operator jog buttons, the sweep runner) never touch the driver; they push
//! [`PositionerCommand`]s into a shared [`CommandBuffer`] through a
//! [`PositionerHandle`].
//!
//! Every tick the task pops the most urgent command (or polls status when the
//! buffer is empty), dispatches it, publishes fresh telemetry and sleeps for
//! the poll interval.
//!
//! ```text
//!  jog buttons ─┐
//!               ├─> CommandBuffer ──> controller task ──> QptDriver ──> serial
//!  sweep runner ┘                          │
//!                                          └─> watch<PositionTelemetry> / broadcast<PositionerEvent>
//! ```

use super::driver::{JogDirection, MoveMode, QptDriver};
use crate::config::PositionerConfig;
use crate::error::{AppResult, DaqError};
use crate::messages::PositionerEvent;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Requests accepted by the controller task.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PositionerCommand {
    /// Halt all motion. Discards everything else pending.
    Stop,
    /// Refresh status. Also issued whenever the queue is empty.
    GetStatus,
    /// Operator jog at the panel speed toward the axis extreme.
    PanelJog(JogDirection),
    /// Jog toward `target` degrees at `speed`.
    Jog {
        /// Axis and sense.
        direction: JogDirection,
        /// Jog speed.
        speed: u8,
        /// Degrees at which the jog is replaced by a stop.
        target: f64,
    },
    /// Move both axes.
    MoveTo {
        /// Pan degrees.
        pan: f64,
        /// Tilt degrees.
        tilt: f64,
        /// How the angles are interpreted.
        mode: MoveMode,
    },
    /// Clear the device angle correction.
    ZeroOffsets,
    /// Align the device angles to the potentiometer center.
    AlignToCenter,
}

impl PositionerCommand {
    /// 0 is most urgent.
    pub fn priority(&self) -> u8 {
        match self {
            PositionerCommand::Stop => 0,
            PositionerCommand::PanelJog(_)
            | PositionerCommand::Jog { .. }
            | PositionerCommand::MoveTo { .. } => 1,
            PositionerCommand::GetStatus
            | PositionerCommand::ZeroOffsets
            | PositionerCommand::AlignToCenter => 2,
        }
    }
}

#[derive(Debug)]
struct Queued {
    priority: u8,
    seq: u64,
    command: PositionerCommand,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // BinaryHeap is a max-heap: lower priority numbers and older entries rank higher.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Priority buffer shared by every producer.
#[derive(Debug, Default)]
pub struct CommandBuffer {
    heap: Mutex<BinaryHeap<Queued>>,
    seq: AtomicU64,
}

impl CommandBuffer {
    /// Empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `command`. A stop empties the buffer first, under the same lock.
    pub fn push(&self, command: PositionerCommand) {
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        let mut heap = self.lock();
        if command == PositionerCommand::Stop {
            heap.clear();
        }
        heap.push(Queued {
            priority: command.priority(),
            seq,
            command,
        });
    }

    /// Most urgent command, oldest first within a priority.
    pub fn pop(&self) -> Option<PositionerCommand> {
        self.lock().pop().map(|q| q.command)
    }

    /// Drop everything pending.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of pending commands.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Nothing pending.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Pending commands, most urgent first.
    pub fn snapshot(&self) -> Vec<PositionerCommand> {
        let mut items: Vec<_> = self.lock().iter().map(|q| (q.priority, q.seq, q.command)).collect();
        items.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        items.into_iter().map(|(_, _, c)| c).collect()
    }

    fn lock(&self) -> MutexGuard<'_, BinaryHeap<Queued>> {
        self.heap
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Position published after every dispatch, in calibrated degrees.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PositionTelemetry {
    /// Pan degrees.
    pub pan: f64,
    /// Tilt degrees.
    pub tilt: f64,
    /// Either axis is moving.
    pub moving: bool,
    /// A fault that needs a reset before the positioner moves again.
    pub hard_fault: bool,
}

/// Controller tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControllerSettings {
    /// Sleep between loop iterations.
    pub poll_interval: Duration,
    /// Speed used for [`PositionerCommand::PanelJog`].
    pub panel_jog_speed: u8,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(120),
            panel_jog_speed: 30,
        }
    }
}

impl From<&PositionerConfig> for ControllerSettings {
    fn from(config: &PositionerConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            panel_jog_speed: config.panel_jog_speed,
        }
    }
}

/// Cloneable producer side of the controller.
#[derive(Clone)]
pub struct PositionerHandle {
    buffer: Arc<CommandBuffer>,
    connected: Arc<AtomicBool>,
    telemetry: watch::Receiver<PositionTelemetry>,
    events: broadcast::Sender<PositionerEvent>,
}

impl PositionerHandle {
    /// Queue a command. Rejected once the controller has disconnected.
    pub fn enqueue(&self, command: PositionerCommand) -> AppResult<()> {
        if !self.is_connected() {
            return Err(DaqError::PositionerNotConnected);
        }
        self.buffer.push(command);
        Ok(())
    }

    /// Whether the link is up and the task is accepting commands.
    pub fn is_connected(&self) -> bool {
        self.connected.load(AtomicOrdering::Acquire)
    }

    /// Latest published position.
    pub fn position(&self) -> PositionTelemetry {
        *self.telemetry.borrow()
    }

    /// Receiver that sees every published position.
    pub fn telemetry(&self) -> watch::Receiver<PositionTelemetry> {
        self.telemetry.clone()
    }

    /// Receiver for position and error events.
    pub fn subscribe(&self) -> broadcast::Receiver<PositionerEvent> {
        self.events.subscribe()
    }

    /// Pending commands, most urgent first.
    pub fn pending(&self) -> Vec<PositionerCommand> {
        self.buffer.snapshot()
    }
}

/// Owner of the controller task.
pub struct PositionerController {
    handle: PositionerHandle,
    quit: Arc<AtomicBool>,
    task: JoinHandle<QptDriver>,
}

impl PositionerController {
    /// Confirm the link, read every device setting once, then start the task.
    ///
    /// # Errors
    /// [`DaqError::PositionerNotConnected`] if the positioner never answered.
    pub async fn connect(mut driver: QptDriver, settings: ControllerSettings) -> AppResult<Self> {
        if !driver.connect().await? {
            return Err(DaqError::PositionerNotConnected);
        }
        driver.update_all_stats().await?;

        let (telemetry_tx, telemetry_rx) = watch::channel(telemetry_of(&driver));
        let (events, _) = broadcast::channel(256);
        let buffer = Arc::new(CommandBuffer::new());
        let connected = Arc::new(AtomicBool::new(true));
        let quit = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(run_loop(
            driver,
            settings,
            Arc::clone(&buffer),
            Arc::clone(&quit),
            telemetry_tx,
            events.clone(),
        ));

        let _ = events.send(PositionerEvent::Connected);
        info!("Positioner controller started");
        Ok(Self {
            handle: PositionerHandle {
                buffer,
                connected,
                telemetry: telemetry_rx,
                events,
            },
            quit,
            task,
        })
    }

    /// A handle for queueing commands and reading telemetry.
    pub fn handle(&self) -> PositionerHandle {
        self.handle.clone()
    }

    /// Stop the task, halt the positioner and release the link.
    pub async fn disconnect(self) -> AppResult<()> {
        self.handle.connected.store(false, AtomicOrdering::Release);
        self.quit.store(true, AtomicOrdering::Release);
        let driver = self
            .task
            .await
            .map_err(|e| DaqError::Sweep(format!("positioner task failed: {e}")))?;
        let result = driver.shutdown().await;
        let _ = self.handle.events.send(PositionerEvent::Disconnected);
        info!("Positioner controller stopped");
        result
    }
}

async fn run_loop(
    mut driver: QptDriver,
    settings: ControllerSettings,
    buffer: Arc<CommandBuffer>,
    quit: Arc<AtomicBool>,
    telemetry: watch::Sender<PositionTelemetry>,
    events: broadcast::Sender<PositionerEvent>,
) -> QptDriver {
    while !quit.load(AtomicOrdering::Acquire) {
        let command = buffer.pop().unwrap_or(PositionerCommand::GetStatus);
        if let Err(e) = dispatch(&mut driver, &buffer, &settings, command).await {
            warn!(?command, error = %e, "Positioner command failed");
            let _ = events.send(PositionerEvent::Error(e.to_string()));
        }

        let current = telemetry_of(&driver);
        telemetry.send_replace(current);
        let _ = events.send(PositionerEvent::Position {
            pan: format!("{:.2}", current.pan),
            tilt: format!("{:.2}", current.tilt),
        });

        tokio::time::sleep(settings.poll_interval).await;
    }
    debug!("Positioner loop exiting");
    driver
}

async fn dispatch(
    driver: &mut QptDriver,
    buffer: &CommandBuffer,
    settings: &ControllerSettings,
    command: PositionerCommand,
) -> AppResult<()> {
    match command {
        PositionerCommand::Stop => {
            let result = driver.move_to(0.0, 0.0, MoveMode::Stop).await;
            // Motion queued while the stop was on the wire is dropped too.
            buffer.clear();
            result
        }
        PositionerCommand::GetStatus => driver.get_status().await.map(|_| ()),
        PositionerCommand::PanelJog(direction) => {
            let calibration = driver.calibration();
            let target = match direction {
                JogDirection::Cw => calibration.pan_bounds().1,
                JogDirection::Ccw => calibration.pan_bounds().0,
                JogDirection::Up => calibration.tilt_bounds().1,
                JogDirection::Down => calibration.tilt_bounds().0,
            };
            driver
                .jog(direction, settings.panel_jog_speed, target)
                .await
        }
        PositionerCommand::Jog {
            direction,
            speed,
            target,
        } => driver.jog(direction, speed, target).await,
        PositionerCommand::MoveTo { pan, tilt, mode } => driver.move_to(pan, tilt, mode).await,
        PositionerCommand::ZeroOffsets => driver.clear_offsets().await,
        PositionerCommand::AlignToCenter => driver.align_to_center().await,
    }
}

fn telemetry_of(driver: &QptDriver) -> PositionTelemetry {
    let status = driver.status();
    PositionTelemetry {
        pan: driver.pan(),
        tilt: driver.tilt(),
        moving: status.motion.is_moving(),
        hard_fault: status.has_hard_fault(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::SimulatedQpt;
    use crate::hardware::qpt::DriverTiming;

    fn jog(target: f64) -> PositionerCommand {
        PositionerCommand::Jog {
            direction: JogDirection::Cw,
            speed: 20,
            target,
        }
    }

    #[test]
    fn pops_by_priority() {
        let buffer = CommandBuffer::new();
        buffer.push(PositionerCommand::AlignToCenter);
        buffer.push(jog(10.0));
        buffer.push(PositionerCommand::GetStatus);
        buffer.push(jog(20.0));

        assert_eq!(buffer.pop(), Some(jog(10.0)));
        assert_eq!(buffer.pop(), Some(jog(20.0)));
        assert_eq!(buffer.pop().map(|c| c.priority()), Some(2));
        assert_eq!(buffer.pop().map(|c| c.priority()), Some(2));
        assert_eq!(buffer.pop(), None);
    }

    #[test]
    fn stop_clears_everything_else() {
        let buffer = CommandBuffer::new();
        for i in 0..5 {
            buffer.push(jog(f64::from(i)));
        }
        buffer.push(PositionerCommand::ZeroOffsets);
        buffer.push(PositionerCommand::Stop);

        assert_eq!(buffer.snapshot(), vec![PositionerCommand::Stop]);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn commands_after_stop_queue_behind_it() {
        let buffer = CommandBuffer::new();
        buffer.push(PositionerCommand::Stop);
        buffer.push(jog(1.0));
        assert_eq!(buffer.pop(), Some(PositionerCommand::Stop));
        assert_eq!(buffer.pop(), Some(jog(1.0)));
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn stop_drops_commands_queued_during_the_exchange() {
        let timing = DriverTiming {
            exchange_timeout: Duration::from_millis(1),
            inter_frame_delay: Duration::ZERO,
            settle_delay: Duration::from_millis(30),
            connect_retries: 5,
        };
        let mut driver = QptDriver::new(Box::new(SimulatedQpt::new()), timing);
        let buffer = Arc::new(CommandBuffer::new());

        let late = Arc::clone(&buffer);
        let producer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            late.push(jog(45.0));
        });

        dispatch(
            &mut driver,
            &buffer,
            &ControllerSettings::default(),
            PositionerCommand::Stop,
        )
        .await
        .unwrap();
        producer.await.unwrap();
        assert!(buffer.is_empty(), "left queued: {:?}", buffer.snapshot());
    }
}
