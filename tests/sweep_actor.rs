//! Sweep manager actor: commands in, CSV file out.

mod common;

use common::{collect_until, connect, fast_positioner, is_finished, pan_sweep, runner_for};
use farfield_daq::error::DaqError;
use farfield_daq::experiment::{SweepManagerActor, SweepState};
use farfield_daq::instrument::mock::SimulatedVna;
use farfield_daq::measurement::{CSV_HEADER, SENTINEL};
use farfield_daq::messages::{SweepCommand, SweepEvent};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_test::assert_ok;

fn read_rows(path: &std::path::Path) -> Vec<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_path(path)
        .expect("measurement file should exist");
    reader
        .records()
        .map(|r| r.expect("valid CSV row").iter().map(str::to_string).collect())
        .collect()
}

#[tokio::test]
async fn test_actor_runs_sweep_to_csv() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("run").join("Jan01_0000_00.csv");

    let sim = fast_positioner();
    let controller = connect(&sim).await;
    let runner = runner_for(&controller);
    let mut events = runner.subscribe();
    let vna = SimulatedVna::new().with_points(|_, i| if i == 0 { (1.0, 0.0) } else { (-1.0, -1.0) });

    let (tx, rx) = mpsc::channel(8);
    let actor = tokio::spawn(SweepManagerActor::new(runner, Arc::new(vna.clone())).run(rx));

    let mut config = pan_sweep(90.0);
    config.impedance = true;
    let (cmd, response) = SweepCommand::start(config, output.clone());
    tx.send(cmd).await.unwrap();
    assert_ok!(response.await.unwrap());

    let seen = collect_until(&mut events, is_finished).await;
    assert_eq!(seen.last(), Some(&SweepEvent::RunComplete));

    let (cmd, state) = SweepCommand::get_state();
    tx.send(cmd).await.unwrap();
    let state = state.await.unwrap();
    assert_eq!(state, SweepState::NotRunning);

    let (cmd, done) = SweepCommand::shutdown();
    tx.send(cmd).await.unwrap();
    done.await.unwrap();
    actor.await.unwrap();
    assert_ok!(controller.disconnect().await);

    let rows = read_rows(&output);
    assert_eq!(rows.first().unwrap(), &CSV_HEADER.to_vec());
    assert_eq!(rows.last().unwrap(), &SENTINEL.to_vec());
    // Header, two S11 rows, four positions at two frequencies, sentinel.
    assert_eq!(rows.len(), 1 + 2 + 8 + 1);

    let s11 = &rows[1];
    assert_eq!(s11[0], "S11");
    assert_eq!(s11[1], "1000");
    assert_eq!(s11[2], "0.000000");
    assert_eq!(s11[4], "0.000000");
    assert_eq!(s11[5], "0.000000");

    let s21 = &rows[3];
    assert_eq!(s21[0], "S21");
    assert_eq!(s21[3], "-180.000000");
    assert_eq!(rows[4][1], "2400");
    // (-1, -1) lies in the third quadrant.
    assert_eq!(rows[4][5], "-135.000000");
}

#[tokio::test]
async fn test_actor_rejects_unsupported_analyzer() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("never.csv");

    let sim = fast_positioner();
    let controller = connect(&sim).await;
    let runner = runner_for(&controller);
    let vna = SimulatedVna::new().with_idn("HEWLETT PACKARD,8720C,0,1.0");

    let (tx, rx) = mpsc::channel(8);
    let actor = tokio::spawn(SweepManagerActor::new(runner, Arc::new(vna)).run(rx));

    let (cmd, response) = SweepCommand::start(pan_sweep(30.0), output.clone());
    tx.send(cmd).await.unwrap();
    let result = response.await.unwrap();
    assert!(matches!(result, Err(DaqError::UnsupportedModel(_))), "{result:?}");
    assert!(!output.exists());

    let (cmd, state) = SweepCommand::get_state();
    tx.send(cmd).await.unwrap();
    assert_eq!(state.await.unwrap(), SweepState::NotRunning);

    let (cmd, response) = SweepCommand::pause();
    tx.send(cmd).await.unwrap();
    assert!(response.await.unwrap().is_err());

    let (cmd, done) = SweepCommand::shutdown();
    tx.send(cmd).await.unwrap();
    done.await.unwrap();
    actor.await.unwrap();
    assert_ok!(controller.disconnect().await);
}

#[tokio::test]
async fn test_shutdown_stops_a_running_sweep() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("stopped.csv");

    let sim = fast_positioner();
    let controller = connect(&sim).await;
    let runner = runner_for(&controller);
    let mut events = runner.subscribe();

    let (tx, rx) = mpsc::channel(8);
    let actor = tokio::spawn(SweepManagerActor::new(runner, Arc::new(SimulatedVna::new())).run(rx));

    let (cmd, response) = SweepCommand::start(pan_sweep(5.0), output.clone());
    tx.send(cmd).await.unwrap();
    assert_ok!(response.await.unwrap());
    collect_until(&mut events, |e| *e == SweepEvent::SetupComplete).await;

    let (cmd, done) = SweepCommand::shutdown();
    tx.send(cmd).await.unwrap();
    done.await.unwrap();
    actor.await.unwrap();

    let seen = collect_until(&mut events, is_finished).await;
    assert_eq!(seen.last(), Some(&SweepEvent::RunStopped));
    let rows = read_rows(&output);
    assert_eq!(rows.last().unwrap(), &SENTINEL.to_vec());
    assert!(rows.len() < 2 + 2 * 72);

    assert_ok!(controller.disconnect().await);
}
