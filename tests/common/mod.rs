//! Shared fixtures: fast timing, a simulated positioner behind a controller,
//! and event helpers.

#![allow(dead_code)]

use farfield_daq::experiment::{
    MovementMode, SweepAxis, SweepConfig, SweepRunner, SweepTiming, TimingTable, VnaDelays,
};
use farfield_daq::hardware::mock::SimulatedQpt;
use farfield_daq::hardware::qpt::packet::{cmd, DecodedFrame};
use farfield_daq::hardware::qpt::{
    ControllerSettings, DriverTiming, PositionerController, QptDriver,
};
use farfield_daq::instrument::mock::SimulatedVna;
use farfield_daq::instrument::{FrequencySpec, VnaSession};
use farfield_daq::messages::SweepEvent;
use std::time::Duration;
use tokio::sync::broadcast;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(20);

pub fn fast_driver_timing() -> DriverTiming {
    DriverTiming {
        exchange_timeout: Duration::from_millis(1),
        inter_frame_delay: Duration::ZERO,
        settle_delay: Duration::ZERO,
        connect_retries: 5,
    }
}

pub fn fast_controller() -> ControllerSettings {
    ControllerSettings {
        poll_interval: Duration::from_millis(1),
        panel_jog_speed: 30,
    }
}

pub fn fast_sweep_timing() -> SweepTiming {
    SweepTiming {
        poll_interval: Duration::from_millis(2),
        jog_interval: Duration::from_millis(2),
        move_polls: 500,
        setup_polls: 1000,
        ..SweepTiming::default()
    }
}

pub fn tiny_delays() -> TimingTable {
    TimingTable::uniform(VnaDelays {
        avg: 0.002,
        s11: 0.001,
        s21: 0.001,
    })
}

/// Positioner at 0/0 that covers 30° per frame.
pub fn fast_positioner() -> SimulatedQpt {
    SimulatedQpt::new().with_move_step(30.0)
}

pub async fn connect(sim: &SimulatedQpt) -> PositionerController {
    let driver = QptDriver::new(Box::new(sim.clone()), fast_driver_timing());
    PositionerController::connect(driver, fast_controller())
        .await
        .expect("simulated positioner should answer")
}

pub fn runner_for(controller: &PositionerController) -> SweepRunner {
    SweepRunner::new(controller.handle(), fast_sweep_timing(), tiny_delays())
}

pub async fn open_vna(vna: &SimulatedVna) -> VnaSession {
    VnaSession::open(Box::new(vna.clone()))
        .await
        .expect("simulated 8753D should identify")
}

/// Pan sweep at `resolution` over two list frequencies.
pub fn pan_sweep(resolution: f64) -> SweepConfig {
    SweepConfig {
        impedance: false,
        frequencies: FrequencySpec::List(vec![1000.0, 2400.0]),
        calibration: false,
        averaging: 1,
        movement: MovementMode::Step,
        pan_offset: 0.0,
        tilt_offset: 0.0,
        axis: SweepAxis::Pan,
        fixed_angle: 0.0,
        resolution,
        gpib_address: 16,
        serial_port: "/dev/null".to_string(),
        baud_rate: 9600,
    }
}

/// Collect events until `done` matches one, which is included.
pub async fn collect_until<F>(events: &mut broadcast::Receiver<SweepEvent>, done: F) -> Vec<SweepEvent>
where
    F: Fn(&SweepEvent) -> bool,
{
    let mut seen = Vec::new();
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let finished = done(&event);
                    seen.push(event);
                    if finished {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };
    tokio::time::timeout(EVENT_TIMEOUT, wait)
        .await
        .expect("timed out waiting for sweep event");
    seen
}

pub fn is_finished(event: &SweepEvent) -> bool {
    matches!(
        event,
        SweepEvent::RunComplete | SweepEvent::RunStopped | SweepEvent::Error(_)
    )
}

/// Stop frames are status/jog frames with the stop flag set.
pub fn is_stop_frame(frame: &DecodedFrame) -> bool {
    frame.command == cmd::GET_STATUS_JOG && frame.payload.first().is_some_and(|f| f & 0x02 != 0)
}

/// Jog frames carry a non-zero pan or tilt byte and no stop flag.
pub fn is_jog_frame(frame: &DecodedFrame) -> bool {
    frame.command == cmd::GET_STATUS_JOG
        && !is_stop_frame(frame)
        && frame.payload.get(1..3).is_some_and(|b| b.iter().any(|&x| x != 0))
}
