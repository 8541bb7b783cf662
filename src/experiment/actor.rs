//! Actor-based sweep management
//!
//! The actor owns the [`SweepRunner`] and processes [`SweepCommand`]s from any
//! number of front ends. A start request opens the analyzer, identifies it and
//! creates the measurement file before the runner is touched, so a bad address
//! or an unsupported analyzer is reported back on the request itself.

use super::config::SweepConfig;
use super::runner::{SweepRunner, SweepState};
use crate::adapters::{InstrumentTransport, VisaTransport};
use crate::error::{AppResult, DaqError};
use crate::instrument::mock::SimulatedVna;
use crate::instrument::VnaSession;
use crate::measurement::CsvSink;
use crate::messages::SweepCommand;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Opens the link to the analyzer named by a sweep configuration.
#[async_trait]
pub trait InstrumentConnector: Send + Sync {
    /// Open a transport to the analyzer at `config.gpib_address`.
    async fn connect(&self, config: &SweepConfig) -> AppResult<Box<dyn InstrumentTransport>>;
}

/// Connects over VISA to `GPIB0::{address}::INSTR`.
#[derive(Debug, Clone)]
pub struct VisaConnector {
    /// Per-operation VISA timeout.
    pub timeout: Duration,
}

#[async_trait]
impl InstrumentConnector for VisaConnector {
    async fn connect(&self, config: &SweepConfig) -> AppResult<Box<dyn InstrumentTransport>> {
        if cfg!(not(feature = "instrument_visa")) {
            return Err(DaqError::FeatureNotEnabled("instrument_visa".to_string()));
        }
        let transport = VisaTransport::open(&config.instrument_resource(), self.timeout).await?;
        Ok(Box::new(transport))
    }
}

#[async_trait]
impl InstrumentConnector for SimulatedVna {
    async fn connect(&self, _config: &SweepConfig) -> AppResult<Box<dyn InstrumentTransport>> {
        Ok(Box::new(self.clone()))
    }
}

/// Actor that owns the sweep runner
pub struct SweepManagerActor {
    runner: SweepRunner,
    connector: Arc<dyn InstrumentConnector>,
}

impl SweepManagerActor {
    /// Wrap `runner`; analyzer links are opened through `connector`.
    pub fn new(runner: SweepRunner, connector: Arc<dyn InstrumentConnector>) -> Self {
        Self { runner, connector }
    }

    /// Runs the actor event loop, processing commands until shutdown
    pub async fn run(mut self, mut command_rx: mpsc::Receiver<SweepCommand>) {
        info!("SweepManagerActor started");

        while let Some(command) = command_rx.recv().await {
            match command {
                SweepCommand::Start {
                    config,
                    output,
                    response,
                } => {
                    let result = self.start(*config, &output).await;
                    let _ = response.send(result);
                }

                SweepCommand::Pause { response } => {
                    let _ = response.send(self.runner.pause());
                }

                SweepCommand::Resume { response } => {
                    let result = self.runner.resume().await;
                    let _ = response.send(result);
                }

                SweepCommand::Stop { response } => {
                    let result = self.runner.stop().await;
                    let _ = response.send(result);
                }

                SweepCommand::ProceedCalibration { stage, response } => {
                    let _ = response.send(self.runner.proceed_calibration(stage));
                }

                SweepCommand::GetState { response } => {
                    let _ = response.send(self.runner.state());
                }

                SweepCommand::Shutdown { response } => {
                    info!("Shutdown command received");
                    self.shutdown().await;
                    let _ = response.send(());
                    break;
                }
            }
        }

        info!("SweepManagerActor shutting down");
    }

    /// The runner this actor drives.
    pub fn runner(&self) -> &SweepRunner {
        &self.runner
    }

    async fn start(&mut self, config: SweepConfig, output: &Path) -> AppResult<()> {
        let state = self.runner.state();
        if !state.can_start() {
            return Err(DaqError::Sweep(format!("cannot start a sweep while {state}")));
        }
        config.validate()?;

        let transport = self.connector.connect(&config).await?;
        let vna = VnaSession::open(transport).await?;
        let sink = CsvSink::create(output)
            .map_err(|e| DaqError::Sweep(format!("cannot create measurement file: {e:#}")))?;

        info!(output = %output.display(), axis = %config.axis, "Starting sweep");
        self.runner.start(config, vna, Box::new(sink)).await
    }

    async fn shutdown(&mut self) {
        if self.runner.state() != SweepState::NotRunning {
            if let Err(e) = self.runner.stop().await {
                warn!(error = %e, "Failed to stop sweep during shutdown");
            }
        }
        if let Err(e) = self.runner.wait().await {
            warn!(error = %e, "Sweep task ended with an error");
        }
    }
}
