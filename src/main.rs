//! `farfield` command-line front end.
//!
//! Drives the positioner and network analyzer from a terminal. Every
//! subcommand reads `farfield.toml` (or `--config`) plus `FARFIELD_*`
//! environment overrides. With `--simulate` both instruments are replaced by
//! in-process simulations, which is useful for checking sweep settings
//! without the range.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use farfield_daq::adapters::{list_ports, PositionerTransport, SerialTransport};
use farfield_daq::config::{AppConfig, SweepSettings, DEFAULT_CONFIG_FILE};
use farfield_daq::experiment::{
    InstrumentConnector, SweepConfig, SweepManagerActor, SweepRunner, SweepTiming, TimingTable,
    VisaConnector, VnaDelays,
};
use farfield_daq::hardware::mock::SimulatedQpt;
use farfield_daq::hardware::qpt::{
    ControllerSettings, DriverTiming, MoveMode, PositionerCommand, PositionerController,
    QptDriver,
};
use farfield_daq::instrument::mock::SimulatedVna;
use farfield_daq::logging::{self, TracingConfig};
use farfield_daq::measurement::output_file_name;
use farfield_daq::messages::{CalibrationStage, SweepCommand, SweepEvent};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "farfield", version, about = "Antenna far-field measurement")]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Use simulated instruments instead of hardware
    #[arg(long)]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List serial ports
    Ports,
    /// Read and print the full positioner status
    Status,
    /// Move the positioner to an absolute position
    Move {
        #[arg(long, allow_hyphen_values = true)]
        pan: f64,
        #[arg(long, allow_hyphen_values = true, default_value_t = 0.0)]
        tilt: f64,
    },
    /// Run a far-field sweep
    Sweep {
        /// JSON sweep settings; defaults to the [sweep] table of the configuration
        #[arg(short, long)]
        settings: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    logging::init(&TracingConfig::from_application(&config.application)?)?;

    match cli.command {
        Command::Ports => {
            for port in list_ports()? {
                println!("{port}");
            }
            Ok(())
        }
        Command::Status => status(&config, cli.simulate).await,
        Command::Move { pan, tilt } => move_positioner(&config, cli.simulate, pan, tilt).await,
        Command::Sweep { settings } => sweep(&config, cli.simulate, settings).await,
    }
}

fn positioner_transport(config: &AppConfig, simulate: bool) -> Result<Box<dyn PositionerTransport>> {
    if simulate {
        return Ok(Box::new(SimulatedQpt::new()));
    }
    let transport = SerialTransport::open(&config.positioner.port, config.positioner.baud_rate)?;
    Ok(Box::new(transport))
}

fn driver(config: &AppConfig, simulate: bool) -> Result<QptDriver> {
    let transport = positioner_transport(config, simulate)?;
    Ok(QptDriver::new(transport, DriverTiming::from(&config.positioner)))
}

async fn status(config: &AppConfig, simulate: bool) -> Result<()> {
    let mut driver = driver(config, simulate)?;
    if !driver.connect().await? {
        bail!("positioner on {} did not answer", config.positioner.port);
    }
    driver.update_all_stats().await?;
    println!("{}", serde_json::to_string_pretty(driver.status())?);
    driver.shutdown().await?;
    Ok(())
}

async fn move_positioner(config: &AppConfig, simulate: bool, pan: f64, tilt: f64) -> Result<()> {
    let settings = ControllerSettings::from(&config.positioner);
    let controller = PositionerController::connect(driver(config, simulate)?, settings).await?;
    let handle = controller.handle();
    handle.enqueue(PositionerCommand::MoveTo {
        pan,
        tilt,
        mode: MoveMode::Absolute,
    })?;

    let mut telemetry = handle.telemetry();
    let deadline = tokio::time::sleep(Duration::from_secs(120));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            changed = telemetry.changed() => {
                changed.context("positioner controller stopped")?;
                let now = *telemetry.borrow_and_update();
                if !now.moving && (now.pan - pan).abs() <= 0.1 && (now.tilt - tilt).abs() <= 0.1 {
                    println!("pan = {:.2}, tilt = {:.2}", now.pan, now.tilt);
                    break;
                }
            }
            _ = &mut deadline => {
                warn!(pan, tilt, "Move did not finish in time");
                break;
            }
        }
    }
    controller.disconnect().await?;
    Ok(())
}

async fn sweep(config: &AppConfig, simulate: bool, settings: Option<PathBuf>) -> Result<()> {
    let settings = match settings {
        Some(path) => SweepSettings::from_json_file(&path)?,
        None => config
            .sweep
            .clone()
            .context("no sweep settings given and no [sweep] table in the configuration")?,
    };
    let sweep_config = SweepConfig::from_settings(&settings, config)?;

    std::fs::create_dir_all(&config.application.output_dir).with_context(|| {
        format!(
            "Failed to create output directory {}",
            config.application.output_dir.display()
        )
    })?;
    let output = config
        .application
        .output_dir
        .join(output_file_name(chrono::Local::now()));

    let (table, timing, connector) = if simulate {
        let delays = VnaDelays {
            avg: 0.05,
            s11: 0.01,
            s21: 0.01,
        };
        let timing = SweepTiming {
            poll_interval: Duration::from_millis(20),
            jog_interval: Duration::from_millis(20),
            ..SweepTiming::default()
        };
        let connector: Arc<dyn InstrumentConnector> = Arc::new(SimulatedVna::new());
        (TimingTable::uniform(delays), timing, connector)
    } else {
        let connector: Arc<dyn InstrumentConnector> = Arc::new(VisaConnector {
            timeout: Duration::from_millis(config.instrument.timeout_ms),
        });
        let table = config.vna_timing.clone().unwrap_or_default();
        (table, SweepTiming::default(), connector)
    };

    let settings = ControllerSettings::from(&config.positioner);
    let controller = PositionerController::connect(driver(config, simulate)?, settings).await?;
    let runner = SweepRunner::new(controller.handle(), timing, table);
    let mut events = runner.subscribe();

    let (tx, rx) = mpsc::channel(32);
    let actor = tokio::spawn(SweepManagerActor::new(runner, connector).run(rx));

    let (start, response) = SweepCommand::start(sweep_config, output.clone());
    tx.send(start).await.context("sweep manager stopped")?;
    response.await.context("sweep manager dropped the request")??;
    info!(output = %output.display(), "Sweep started");

    let result = follow(&tx, &mut events).await;

    let (shutdown, done) = SweepCommand::shutdown();
    if tx.send(shutdown).await.is_ok() {
        let _ = done.await;
    }
    if let Err(e) = actor.await {
        warn!(error = %e, "Sweep manager task failed");
    }
    controller.disconnect().await?;
    println!("{}", output.display());
    result
}

/// Print progress until the sweep ends. Ctrl-C stops the sweep.
async fn follow(
    tx: &mpsc::Sender<SweepCommand>,
    events: &mut broadcast::Receiver<SweepEvent>,
) -> Result<()> {
    let mut stopping = false;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SweepEvent::Progress(percent)) => println!("progress {percent:>3}%"),
                Ok(SweepEvent::CalibrationReady(stage)) => {
                    confirm_standard(stage).await?;
                    let (command, response) = SweepCommand::proceed_calibration(stage);
                    tx.send(command).await.context("sweep manager stopped")?;
                    response.await.context("sweep manager dropped the request")??;
                }
                Ok(SweepEvent::SetupComplete) => println!("setup complete"),
                Ok(SweepEvent::RunComplete) => {
                    println!("sweep complete");
                    return Ok(());
                }
                Ok(SweepEvent::RunStopped) => {
                    println!("sweep stopped");
                    return Ok(());
                }
                Ok(SweepEvent::Error(message)) => bail!("sweep failed: {message}"),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Progress printer fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => bail!("sweep events closed"),
            },
            _ = tokio::signal::ctrl_c(), if !stopping => {
                stopping = true;
                println!("stopping...");
                let (command, response) = SweepCommand::stop();
                tx.send(command).await.context("sweep manager stopped")?;
                response.await.context("sweep manager dropped the request")??;
            }
        }
    }
}

async fn confirm_standard(stage: CalibrationStage) -> Result<()> {
    println!("{}, then press Enter", stage.prompt());
    tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        std::io::stdin().read_line(&mut line).map(|_| ())
    })
    .await
    .context("stdin reader failed")?
    .context("failed to read from stdin")
}
