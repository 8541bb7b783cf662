//! Simulated network analyzer.
//!
//! Answers `*IDN?` with a configurable identification string, records every
//! command it receives and produces binary trace dumps of whatever length the
//! session asks for. Clones share state so a test can inspect the command log
//! while the session owns the transport.

use crate::adapters::InstrumentTransport;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};

type PointFn = dyn Fn(usize, usize) -> (f32, f32) + Send + Sync;

struct VnaState {
    idn: String,
    commands: Vec<String>,
    dumps: usize,
    point: Arc<PointFn>,
    fail_reads: bool,
}

/// Scriptable stand-in for an HP 8753D on GPIB.
#[derive(Clone)]
pub struct SimulatedVna {
    state: Arc<Mutex<VnaState>>,
}

impl Default for SimulatedVna {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedVna {
    /// An 8753D returning `0.1 + 0.1j` at every point.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(VnaState {
                idn: "HEWLETT PACKARD,8753D,0,6.14".to_string(),
                commands: Vec::new(),
                dumps: 0,
                point: Arc::new(|_, _| (0.1, 0.1)),
                fail_reads: false,
            })),
        }
    }

    /// Answer `*IDN?` with `idn`.
    pub fn with_idn(self, idn: &str) -> Self {
        self.lock().idn = idn.to_string();
        self
    }

    /// Trace generator, called with `(dump index, point index)`.
    pub fn with_points<F>(self, point: F) -> Self
    where
        F: Fn(usize, usize) -> (f32, f32) + Send + Sync + 'static,
    {
        self.lock().point = Arc::new(point);
        self
    }

    /// Make trace reads time out until cleared.
    pub fn set_fail_reads(&self, fail: bool) {
        self.lock().fail_reads = fail;
    }

    /// Every command written or queried, in order.
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    /// Forget the commands received so far.
    pub fn clear_commands(&self) {
        self.lock().commands.clear();
    }

    /// Number of trace dumps served.
    pub fn dumps(&self) -> usize {
        self.lock().dumps
    }

    fn lock(&self) -> MutexGuard<'_, VnaState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl InstrumentTransport for SimulatedVna {
    async fn write(&mut self, command: &str) -> Result<()> {
        self.lock().commands.push(command.to_string());
        Ok(())
    }

    async fn query(&mut self, command: &str) -> Result<String> {
        let mut state = self.lock();
        state.commands.push(command.to_string());
        match command {
            "*IDN?" => Ok(format!("{}\n", state.idn)),
            other => Err(anyhow!("simulated analyzer has no answer for {other}")),
        }
    }

    async fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut state = self.lock();
        if state.fail_reads {
            return Err(anyhow!("simulated GPIB timeout"));
        }
        let dump = state.dumps;
        state.dumps += 1;
        let mut bytes = vec![0x23, 0x41, 0x00, 0x00];
        let points = len.saturating_sub(4) / 8;
        for i in 0..points {
            let (re, im) = (state.point)(dump, i);
            bytes.extend_from_slice(&re.to_be_bytes());
            bytes.extend_from_slice(&im.to_be_bytes());
        }
        Ok(bytes)
    }
}
