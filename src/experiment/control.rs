//! Sweep control flags and cooperative cancellation.
//!
//! Front ends never reach into a running sweep. They flip flags here and the
//! run loop looks at them at fixed poll points, so the last write wins.

use crate::messages::CalibrationStage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Flags shared between a sweep's run loop and whoever controls it.
#[derive(Debug, Default)]
pub struct SweepControlFlags {
    resume: AtomicBool,
    pause_move: AtomicBool,
    pause_jog: AtomicBool,
    stop: AtomicBool,
    proceed: [AtomicBool; 3],
}

impl SweepControlFlags {
    /// All flags clear.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear everything before a new sweep.
    pub fn reset(&self) {
        for flag in [&self.resume, &self.pause_move, &self.pause_jog, &self.stop] {
            flag.store(false, Ordering::Release);
        }
        for flag in &self.proceed {
            flag.store(false, Ordering::Release);
        }
    }

    /// Ask the run loop to pause at its next poll point.
    pub fn request_pause(&self) {
        self.pause_move.store(true, Ordering::Release);
    }

    /// Consume a pending pause request.
    pub fn take_pause(&self) -> bool {
        self.pause_move.swap(false, Ordering::AcqRel)
    }

    /// Whether a pause is pending, without consuming it.
    pub fn pause_requested(&self) -> bool {
        self.pause_move.load(Ordering::Acquire)
    }

    /// Mark the next run as a resume of a paused one.
    pub fn request_resume(&self) {
        self.resume.store(true, Ordering::Release);
    }

    /// Consume a pending resume.
    pub fn take_resume(&self) -> bool {
        self.resume.swap(false, Ordering::AcqRel)
    }

    /// Ask the run loop to stop. Stays set until [`reset`](Self::reset).
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Whether a stop was requested.
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Tell the jog sender to quit.
    pub fn halt_jog(&self) {
        self.pause_jog.store(true, Ordering::Release);
    }

    /// Allow a new jog sender to run.
    pub fn release_jog(&self) {
        self.pause_jog.store(false, Ordering::Release);
    }

    /// Whether the jog sender has been told to quit.
    pub fn jog_halted(&self) -> bool {
        self.pause_jog.load(Ordering::Acquire)
    }

    /// The operator has fitted the standard for `stage`.
    pub fn proceed(&self, stage: CalibrationStage) {
        self.proceed[stage.index()].store(true, Ordering::Release);
    }

    /// Whether the operator has released `stage`.
    pub fn may_proceed(&self, stage: CalibrationStage) -> bool {
        self.proceed[stage.index()].load(Ordering::Acquire)
    }
}

/// One-shot cancellation signal.
///
/// Cloning shares the signal. Once cancelled it stays cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    /// A token that has not been cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel every clone and wake their waiters.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a cancel in between is not missed.
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Sleep for `duration` unless `token` fires first.
///
/// Returns `true` if the full delay elapsed.
pub async fn cancellable_delay(duration: Duration, token: &CancelToken) -> bool {
    if token.is_cancelled() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = token.cancelled() => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn pause_is_consumed_once() {
        let flags = SweepControlFlags::new();
        flags.request_pause();
        assert!(flags.pause_requested());
        assert!(flags.take_pause());
        assert!(!flags.take_pause());
    }

    #[test]
    fn reset_clears_all_flags() {
        let flags = SweepControlFlags::new();
        flags.request_stop();
        flags.request_resume();
        flags.halt_jog();
        flags.proceed(CalibrationStage::Short);
        flags.reset();
        assert!(!flags.stop_requested());
        assert!(!flags.take_resume());
        assert!(!flags.jog_halted());
        assert!(CalibrationStage::ALL.iter().all(|s| !flags.may_proceed(*s)));
    }

    #[test]
    fn calibration_stages_are_independent() {
        let flags = SweepControlFlags::new();
        flags.proceed(CalibrationStage::Open);
        assert!(flags.may_proceed(CalibrationStage::Open));
        assert!(!flags.may_proceed(CalibrationStage::Load));
    }

    #[tokio::test]
    async fn delay_runs_to_completion() {
        let token = CancelToken::new();
        assert!(cancellable_delay(Duration::from_millis(5), &token).await);
    }

    #[tokio::test]
    async fn cancel_cuts_delay_short() {
        let token = CancelToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });
        let started = Instant::now();
        assert!(!cancellable_delay(Duration::from_secs(10), &token).await);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!cancellable_delay(Duration::from_secs(10), &token).await);
    }
}
