//! Sweep state machine against simulated hardware.

mod common;

use common::{
    collect_until, connect, fast_positioner, is_finished, is_jog_frame, is_stop_frame, open_vna,
    pan_sweep, runner_for,
};
use farfield_daq::error::DaqError;
use farfield_daq::experiment::{MovementMode, SweepAxis, SweepState};
use farfield_daq::instrument::mock::SimulatedVna;
use farfield_daq::measurement::{MeasurementKind, MemorySink, SinkRow};
use farfield_daq::messages::{CalibrationStage, SweepEvent};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

fn s21_phis(sink: &MemorySink, freq: f64) -> Vec<f64> {
    sink.samples()
        .iter()
        .filter(|s| s.kind == MeasurementKind::S21 && s.freq == freq)
        .map(|s| s.phi)
        .collect()
}

fn progress_of(events: &[SweepEvent]) -> Vec<u8> {
    events
        .iter()
        .filter_map(|e| match e {
            SweepEvent::Progress(p) => Some(*p),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_step_sweep_measures_every_position() {
    let sim = fast_positioner();
    let controller = connect(&sim).await;
    let mut runner = runner_for(&controller);
    let mut events = runner.subscribe();
    let vna = SimulatedVna::new();
    let sink = MemorySink::new();

    assert_ok!(
        runner
            .start(pan_sweep(30.0), open_vna(&vna).await, Box::new(sink.clone()))
            .await
    );
    let seen = collect_until(&mut events, is_finished).await;
    assert_ok!(runner.wait().await);

    assert_eq!(seen.last(), Some(&SweepEvent::RunComplete));
    assert!(seen.contains(&SweepEvent::SetupComplete));
    assert!(seen.contains(&SweepEvent::StateChanged(SweepState::Running)));
    let progress = progress_of(&seen);
    assert_eq!(progress.len(), 12);
    assert_eq!(progress.last(), Some(&100));
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(progress[0], 8);

    let expected: Vec<f64> = (0..12).map(|k| -180.0 + 30.0 * f64::from(k)).collect();
    assert_eq!(s21_phis(&sink, 1000.0), expected);
    assert_eq!(s21_phis(&sink, 2400.0), expected);
    assert!(sink.samples().iter().all(|s| s.theta == 0.0));
    assert!(sink.is_terminated());
    assert_eq!(runner.state(), SweepState::NotRunning);

    assert_ok!(controller.disconnect().await);
}

#[tokio::test]
async fn test_pause_and_resume_do_not_repeat_a_step() {
    let sim = fast_positioner();
    let controller = connect(&sim).await;
    let mut runner = runner_for(&controller);
    let mut events = runner.subscribe();
    let vna = SimulatedVna::new();
    let sink = MemorySink::new();

    assert_ok!(
        runner
            .start(pan_sweep(60.0), open_vna(&vna).await, Box::new(sink.clone()))
            .await
    );
    collect_until(&mut events, |e| *e == SweepEvent::SetupComplete).await;
    assert_ok!(runner.pause());
    let seen = collect_until(&mut events, |e| {
        *e == SweepEvent::RunPaused || is_finished(e)
    })
    .await;
    assert_eq!(seen.last(), Some(&SweepEvent::RunPaused));
    assert_ok!(runner.wait().await);
    assert_eq!(runner.state(), SweepState::Paused);

    let before = s21_phis(&sink, 1000.0);
    assert!(!before.is_empty() && before.len() < 6);
    assert!(!sink.is_terminated());
    // Pausing twice is refused.
    assert_err!(runner.pause());

    assert_ok!(runner.resume().await);
    let seen = collect_until(&mut events, is_finished).await;
    assert_eq!(seen.last(), Some(&SweepEvent::RunComplete));
    assert_ok!(runner.wait().await);

    let expected: Vec<f64> = (0..6).map(|k| -180.0 + 60.0 * f64::from(k)).collect();
    assert_eq!(s21_phis(&sink, 1000.0), expected);
    assert!(sink.is_terminated());

    assert_ok!(controller.disconnect().await);
}

#[tokio::test]
async fn test_stop_writes_end_marker_without_completing() {
    let sim = fast_positioner();
    let controller = connect(&sim).await;
    let mut runner = runner_for(&controller);
    let mut events = runner.subscribe();
    let vna = SimulatedVna::new();
    let sink = MemorySink::new();

    let mut config = pan_sweep(10.0);
    config.frequencies = farfield_daq::instrument::FrequencySpec::List(vec![1500.0]);
    assert_ok!(
        runner
            .start(config, open_vna(&vna).await, Box::new(sink.clone()))
            .await
    );
    collect_until(&mut events, |e| *e == SweepEvent::SetupComplete).await;
    assert_ok!(runner.stop().await);
    let seen = collect_until(&mut events, is_finished).await;
    assert_ok!(runner.wait().await);

    assert_eq!(seen.last(), Some(&SweepEvent::RunStopped));
    assert!(!seen.contains(&SweepEvent::RunComplete));
    assert_eq!(progress_of(&seen).last(), Some(&0));
    assert!(sink.is_terminated());
    assert!(s21_phis(&sink, 1500.0).len() < 36);
    assert_eq!(runner.state(), SweepState::NotRunning);

    // A finished runner accepts a new sweep.
    let again = MemorySink::new();
    assert_ok!(
        runner
            .start(pan_sweep(90.0), open_vna(&vna).await, Box::new(again.clone()))
            .await
    );
    collect_until(&mut events, is_finished).await;
    assert_ok!(runner.wait().await);
    assert_eq!(s21_phis(&again, 1000.0).len(), 4);

    assert_ok!(controller.disconnect().await);
}

#[tokio::test]
async fn test_stop_while_paused_closes_out() {
    let sim = fast_positioner();
    let controller = connect(&sim).await;
    let mut runner = runner_for(&controller);
    let mut events = runner.subscribe();
    let vna = SimulatedVna::new();
    let sink = MemorySink::new();

    assert_ok!(
        runner
            .start(pan_sweep(30.0), open_vna(&vna).await, Box::new(sink.clone()))
            .await
    );
    collect_until(&mut events, |e| *e == SweepEvent::SetupComplete).await;
    assert_ok!(runner.pause());
    collect_until(&mut events, |e| *e == SweepEvent::RunPaused || is_finished(e)).await;
    assert_ok!(runner.wait().await);

    assert_ok!(runner.stop().await);
    let seen = collect_until(&mut events, is_finished).await;
    assert_eq!(seen.last(), Some(&SweepEvent::RunStopped));
    assert!(sink.is_terminated());
    assert_eq!(runner.state(), SweepState::NotRunning);
    assert_err!(runner.resume().await);

    assert_ok!(controller.disconnect().await);
}

#[tokio::test]
async fn test_stop_mid_move_records_nothing_off_grid() {
    // Half a degree per tick keeps the 30° move between steps in flight.
    let sim = fast_positioner()
        .with_move_step(0.5)
        .with_position(-180.0, 0.0);
    let controller = connect(&sim).await;
    let mut runner = runner_for(&controller);
    let mut events = runner.subscribe();
    let vna = SimulatedVna::new();
    let sink = MemorySink::new();

    assert_ok!(
        runner
            .start(pan_sweep(30.0), open_vna(&vna).await, Box::new(sink.clone()))
            .await
    );
    let mut seen = collect_until(&mut events, |e| matches!(e, SweepEvent::Progress(_))).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_ok!(runner.stop().await);
    seen.extend(collect_until(&mut events, is_finished).await);
    assert_ok!(runner.wait().await);

    assert_eq!(seen.last(), Some(&SweepEvent::RunStopped));
    assert!(sink.is_terminated());

    let phis = s21_phis(&sink, 1000.0);
    assert!(!phis.is_empty());
    for phi in &phis {
        let offset = (phi + 180.0) / 30.0;
        assert!((offset - offset.round()).abs() < 1e-6, "off-grid sample at {phi}: {phis:?}");
    }

    // One progress report per recorded position, then the reset to zero.
    let progress = progress_of(&seen);
    assert_eq!(progress.last(), Some(&0));
    assert_eq!(progress.iter().filter(|p| **p > 0).count(), phis.len());

    assert_ok!(controller.disconnect().await);
}

#[tokio::test]
async fn test_continuous_sweep_jogs_then_stops() {
    let sim = fast_positioner().with_jog_scale(0.5);
    let controller = connect(&sim).await;
    let mut runner = runner_for(&controller);
    let mut events = runner.subscribe();
    let vna = SimulatedVna::new();
    let sink = MemorySink::new();

    let mut config = pan_sweep(90.0);
    config.movement = MovementMode::Continuous;
    assert_ok!(
        runner
            .start(config, open_vna(&vna).await, Box::new(sink.clone()))
            .await
    );
    let seen = collect_until(&mut events, is_finished).await;
    assert_ok!(runner.wait().await);
    assert_eq!(seen.last(), Some(&SweepEvent::RunComplete));

    let phis = s21_phis(&sink, 1000.0);
    assert_eq!(phis.len(), 4);
    assert_eq!(phis[0], -180.0);
    assert!(phis.windows(2).all(|w| w[0] <= w[1]), "{phis:?}");
    assert!(sink.is_terminated());

    // The closing stop goes through the controller queue; give it a moment.
    let stopped_after_jog = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let frames = sim.received();
            let first_jog = frames.iter().position(is_jog_frame);
            let last_stop = frames.iter().rposition(is_stop_frame);
            if let (Some(jog), Some(stop)) = (first_jog, last_stop) {
                if stop > jog {
                    return true;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert_eq!(stopped_after_jog, Ok(true));

    assert_ok!(controller.disconnect().await);
}

#[tokio::test]
async fn test_slow_continuous_sweep_falls_back_to_steps() {
    let sim = fast_positioner();
    let controller = connect(&sim).await;
    let mut runner = farfield_daq::experiment::SweepRunner::new(
        controller.handle(),
        common::fast_sweep_timing(),
        // 12 steps at 200 s each exceeds the pan budget.
        farfield_daq::experiment::TimingTable::uniform(farfield_daq::experiment::VnaDelays {
            avg: 0.0,
            s11: 0.0,
            s21: 200.0,
        }),
    );
    let mut events = runner.subscribe();
    let vna = SimulatedVna::new();
    let sink = MemorySink::new();

    let mut config = pan_sweep(30.0);
    config.movement = MovementMode::Continuous;
    assert_ok!(
        runner
            .start(config, open_vna(&vna).await, Box::new(sink.clone()))
            .await
    );
    collect_until(&mut events, is_finished).await;
    assert_ok!(runner.wait().await);

    assert_eq!(s21_phis(&sink, 1000.0).len(), 12);
    assert!(!sim.received().iter().any(is_jog_frame));

    assert_ok!(controller.disconnect().await);
}

#[tokio::test]
async fn test_tilt_sweep_holds_pan() {
    let sim = fast_positioner();
    let controller = connect(&sim).await;
    let mut runner = runner_for(&controller);
    let mut events = runner.subscribe();
    let vna = SimulatedVna::new();
    let sink = MemorySink::new();

    let mut config = pan_sweep(45.0);
    config.axis = SweepAxis::Tilt;
    config.fixed_angle = 30.0;
    assert_ok!(
        runner
            .start(config, open_vna(&vna).await, Box::new(sink.clone()))
            .await
    );
    collect_until(&mut events, is_finished).await;
    assert_ok!(runner.wait().await);

    let thetas: Vec<f64> = sink
        .samples()
        .iter()
        .filter(|s| s.freq == 1000.0)
        .map(|s| s.theta)
        .collect();
    assert_eq!(thetas, vec![-90.0, -45.0, 0.0, 45.0]);
    assert!(sink.samples().iter().all(|s| s.phi == 30.0));

    assert_ok!(controller.disconnect().await);
}

#[tokio::test]
async fn test_impedance_trace_is_recorded_first() {
    let sim = fast_positioner().with_position(40.0, 10.0);
    let controller = connect(&sim).await;
    let mut runner = runner_for(&controller);
    let mut events = runner.subscribe();
    let vna = SimulatedVna::new();
    let sink = MemorySink::new();

    let mut config = pan_sweep(90.0);
    config.impedance = true;
    assert_ok!(
        runner
            .start(config, open_vna(&vna).await, Box::new(sink.clone()))
            .await
    );
    collect_until(&mut events, is_finished).await;
    assert_ok!(runner.wait().await);

    let rows = sink.rows();
    let first_two: Vec<_> = rows
        .iter()
        .take(2)
        .map(|r| match r {
            SinkRow::Sample(s) => (s.kind, s.theta, s.phi),
            SinkRow::End => panic!("end marker before samples"),
        })
        .collect();
    assert_eq!(
        first_two,
        vec![(MeasurementKind::S11, 0.0, 0.0), (MeasurementKind::S11, 0.0, 0.0)]
    );
    let s11 = sink
        .samples()
        .iter()
        .filter(|s| s.kind == MeasurementKind::S11)
        .count();
    assert_eq!(s11, 2);

    let commands = vna.commands();
    let setup = commands.iter().position(|c| c.starts_with("IFBW")).expect("no IFBW");
    let s11_select = commands.iter().position(|c| c == "S11").expect("no S11");
    assert!(s11_select > setup);

    assert_ok!(controller.disconnect().await);
}

#[tokio::test]
async fn test_calibration_waits_for_each_standard() {
    let sim = fast_positioner();
    let controller = connect(&sim).await;
    let mut runner = runner_for(&controller);
    let mut events = runner.subscribe();
    let vna = SimulatedVna::new();
    let sink = MemorySink::new();

    let mut config = pan_sweep(90.0);
    config.calibration = true;
    assert_ok!(
        runner
            .start(config, open_vna(&vna).await, Box::new(sink.clone()))
            .await
    );

    for stage in CalibrationStage::ALL {
        collect_until(&mut events, |e| *e == SweepEvent::CalibrationReady(stage)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        // Still gated.
        assert_eq!(runner.state(), SweepState::SetupRunning);
        assert_ok!(runner.proceed_calibration(stage));
    }
    let seen = collect_until(&mut events, is_finished).await;
    assert_eq!(seen.last(), Some(&SweepEvent::RunComplete));
    assert_ok!(runner.wait().await);

    let commands = vna.commands();
    let order: Vec<&str> = commands
        .iter()
        .map(String::as_str)
        .filter(|c| ["PRES", "CLASS11A", "CLASS11B", "CLASS11C", "SAV1", "CORRON"].contains(c))
        .collect();
    // Saved, enabled, then enabled again once the stimulus is programmed.
    assert_eq!(
        order,
        vec!["PRES", "CLASS11A", "CLASS11B", "CLASS11C", "SAV1", "CORRON", "CORRON"]
    );
    let ifbw = commands.iter().position(|c| c.starts_with("IFBW")).unwrap();
    let last_corr = commands.iter().rposition(|c| c == "CORRON").unwrap();
    assert!(last_corr > ifbw);
    assert!(!commands.iter().any(|c| c == "CLEL"));

    // Outside setup the gate is closed.
    assert_err!(runner.proceed_calibration(CalibrationStage::Open));

    assert_ok!(controller.disconnect().await);
}

#[tokio::test]
async fn test_analyzer_failure_aborts_with_end_marker() {
    let sim = fast_positioner();
    let controller = connect(&sim).await;
    let mut runner = runner_for(&controller);
    let mut events = runner.subscribe();
    let vna = SimulatedVna::new();
    let sink = MemorySink::new();

    let session = open_vna(&vna).await;
    vna.set_fail_reads(true);
    assert_ok!(
        runner
            .start(pan_sweep(30.0), session, Box::new(sink.clone()))
            .await
    );
    let seen = collect_until(&mut events, is_finished).await;
    assert_ok!(runner.wait().await);

    assert!(matches!(seen.last(), Some(SweepEvent::Error(_))));
    assert!(sink.is_terminated());
    assert!(sink.samples().is_empty());
    assert_eq!(runner.state(), SweepState::NotRunning);

    assert_ok!(controller.disconnect().await);
}

#[tokio::test]
async fn test_invalid_requests_are_rejected() {
    let sim = fast_positioner();
    let controller = connect(&sim).await;
    let mut runner = runner_for(&controller);
    let vna = SimulatedVna::new();

    assert_err!(runner.pause());
    assert_err!(runner.resume().await);
    assert_err!(runner.stop().await);

    let mut bad = pan_sweep(30.0);
    bad.resolution = 0.0;
    let rejected = assert_err!(
        runner
            .start(bad, open_vna(&vna).await, Box::new(MemorySink::new()))
            .await
    );
    assert!(matches!(rejected, DaqError::Configuration(_)));
    assert_eq!(runner.state(), SweepState::NotRunning);

    let handle = controller.handle();
    assert_ok!(controller.disconnect().await);
    assert!(!handle.is_connected());
    let rejected = assert_err!(
        runner
            .start(pan_sweep(30.0), open_vna(&vna).await, Box::new(MemorySink::new()))
            .await
    );
    assert!(matches!(rejected, DaqError::PositionerNotConnected));
}
