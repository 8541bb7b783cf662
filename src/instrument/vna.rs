//! Vector network analyzer session.
//!
//! Opening a session identifies the analyzer from its `*IDN?` reply, selects
//! the command table for that model and switches trace transfers to binary.
//! From then on the session speaks in actions; the table supplies the strings.
//!
//! Trace dumps arrive as a 4-byte header followed by one `(re, im)` pair of
//! big-endian `f32`s per frequency point. They are converted to magnitude in dB
//! and phase in degrees before leaving this module.

use super::syntax::{CommandSyntax, Model};
use crate::adapters::InstrumentTransport;
use crate::error::{AppResult, DaqError};
use crate::measurement::{MeasurementKind, MeasurementSample};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Most frequencies a list sweep may hold.
pub const MAX_LIST_FREQUENCIES: usize = 30;

const TRACE_HEADER_LEN: usize = 4;
const TRACE_POINT_LEN: usize = 8;
const MAGNITUDE_EPSILON: f64 = 1e-60;

/// Frequencies to measure, in MHz.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrequencySpec {
    /// Explicit frequencies, at most 30.
    List(Vec<f64>),
    /// Evenly spaced points from `start` to `stop`, both included.
    Linear {
        /// First frequency.
        start: f64,
        /// Last frequency.
        stop: f64,
        /// Number of points.
        points: u32,
    },
}

impl FrequencySpec {
    /// Number of points the analyzer returns per trace.
    pub fn count(&self) -> usize {
        match self {
            FrequencySpec::List(freqs) => freqs.len(),
            FrequencySpec::Linear { points, .. } => *points as usize,
        }
    }

    /// Every frequency in sweep order.
    pub fn frequencies(&self) -> Vec<f64> {
        match self {
            FrequencySpec::List(freqs) => freqs.clone(),
            FrequencySpec::Linear {
                start,
                stop,
                points,
            } => {
                if *points <= 1 {
                    return vec![*start; *points as usize];
                }
                let span = stop - start;
                let last = f64::from(points - 1);
                (0..*points)
                    .map(|i| start + f64::from(i) * span / last)
                    .collect()
            }
        }
    }

    /// Structural checks that do not depend on the analyzer model.
    pub fn validate(&self) -> AppResult<()> {
        match self {
            FrequencySpec::List(freqs) => {
                if freqs.is_empty() {
                    return Err(DaqError::Configuration(
                        "frequency list is empty".to_string(),
                    ));
                }
                if freqs.len() > MAX_LIST_FREQUENCIES {
                    return Err(DaqError::Configuration(format!(
                        "frequency list has {} entries, at most {MAX_LIST_FREQUENCIES} are supported",
                        freqs.len()
                    )));
                }
                if freqs.iter().any(|f| !f.is_finite() || *f <= 0.0) {
                    return Err(DaqError::Configuration(
                        "frequency list contains a non-positive value".to_string(),
                    ));
                }
            }
            FrequencySpec::Linear {
                start,
                stop,
                points,
            } => {
                if *points == 0 {
                    return Err(DaqError::Configuration(
                        "linear sweep needs at least one point".to_string(),
                    ));
                }
                if !(start.is_finite() && stop.is_finite()) || stop < start {
                    return Err(DaqError::Configuration(format!(
                        "linear sweep stop {stop} MHz is below start {start} MHz"
                    )));
                }
            }
        }
        Ok(())
    }
}

fn mhz_to_khz(mhz: f64) -> u64 {
    (mhz * 1000.0).trunc().max(0.0) as u64
}

/// Magnitude of `re + j·im` in dB. Finite even for a zero input.
pub fn magnitude_db(re: f64, im: f64) -> f64 {
    20.0 * ((re * re + im * im).sqrt() + MAGNITUDE_EPSILON).log10()
}

/// Phase of `re + j·im` in degrees, in `(-180, 180]`.
pub fn phase_degrees(re: f64, im: f64) -> f64 {
    if re == 0.0 {
        return if im > 0.0 { 90.0 } else { -90.0 };
    }
    if im == 0.0 {
        return if re > 0.0 { 0.0 } else { 180.0 };
    }
    let p = (im / re).atan().to_degrees();
    if re < 0.0 {
        if im > 0.0 {
            return p + 180.0;
        }
        return p - 180.0;
    }
    p
}

/// Split a binary trace dump into `(re, im)` pairs.
pub fn decode_trace(bytes: &[u8], points: usize) -> AppResult<Vec<(f32, f32)>> {
    let expected = TRACE_HEADER_LEN + TRACE_POINT_LEN * points;
    if bytes.len() < expected {
        return Err(DaqError::Instrument(format!(
            "trace dump too short: {} bytes, expected {expected}",
            bytes.len()
        )));
    }
    let body = &bytes[TRACE_HEADER_LEN..expected];
    Ok(body
        .chunks_exact(TRACE_POINT_LEN)
        .map(|chunk| {
            let re = f32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            let im = f32::from_be_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]);
            (re, im)
        })
        .collect())
}

/// Command session with one analyzer.
pub struct VnaSession {
    transport: Box<dyn InstrumentTransport>,
    model: Model,
    syntax: &'static dyn CommandSyntax,
    frequencies: Option<FrequencySpec>,
    using_correction: bool,
}

impl VnaSession {
    /// Identify the analyzer and prepare it for binary transfers.
    ///
    /// # Errors
    /// [`DaqError::UnsupportedModel`] if the identification string matches no
    /// known model.
    pub async fn open(mut transport: Box<dyn InstrumentTransport>) -> AppResult<Self> {
        let idn = transport.query("*IDN?").await?;
        let model = Model::identify(&idn)?;
        let syntax = model.syntax();
        transport.write(syntax.binary_format()).await?;
        info!(model = syntax.name(), idn = idn.trim(), "Analyzer session opened");
        Ok(Self {
            transport,
            model,
            syntax,
            frequencies: None,
            using_correction: false,
        })
    }

    /// Identified model.
    pub fn model(&self) -> Model {
        self.model
    }

    /// Whether a saved calibration should be active.
    pub fn using_correction(&self) -> bool {
        self.using_correction
    }

    /// Frequencies programmed by the last [`setup`](Self::setup).
    pub fn frequencies(&self) -> Option<&FrequencySpec> {
        self.frequencies.as_ref()
    }

    async fn write(&mut self, command: &str) -> AppResult<()> {
        debug!(command, "VNA write");
        self.transport.write(command).await?;
        Ok(())
    }

    async fn write_all(&mut self, commands: &[String]) -> AppResult<()> {
        for command in commands {
            self.write(command).await?;
        }
        Ok(())
    }

    /// Factory preset. Calibration is lost.
    pub async fn reset_all(&mut self) -> AppResult<()> {
        self.write(self.syntax.preset()).await?;
        self.using_correction = false;
        Ok(())
    }

    /// Clear the frequency list only. Calibration is kept.
    pub async fn reset(&mut self) -> AppResult<()> {
        self.write(self.syntax.edit_list()).await?;
        self.write(self.syntax.clear_list()).await
    }

    /// Configure frequencies, averaging and IF bandwidth.
    ///
    /// Every command is built, and so every argument checked, before anything
    /// is sent.
    pub async fn setup(
        &mut self,
        frequencies: &FrequencySpec,
        averaging: u32,
        if_bandwidth: u32,
    ) -> AppResult<()> {
        frequencies.validate()?;
        let s = self.syntax;
        let mut commands = Vec::new();
        match frequencies {
            FrequencySpec::List(freqs) => {
                for f in freqs {
                    commands.push(s.edit_list().to_string());
                    commands.push(s.add_list_frequency(mhz_to_khz(*f))?);
                }
                commands.push(s.list_mode().to_string());
            }
            FrequencySpec::Linear {
                start,
                stop,
                points,
            } => {
                commands.push(s.linear_start(mhz_to_khz(*start))?);
                commands.push(s.linear_stop(mhz_to_khz(*stop))?);
                commands.push(s.linear_points(*points)?);
                commands.push(s.linear_mode().to_string());
            }
        }
        commands.push(s.averaging_factor(averaging)?);
        commands.push(s.averaging_on().to_string());
        commands.push(s.averaging_restart().to_string());
        commands.push(s.if_bandwidth(if_bandwidth)?);
        // Editing the stimulus can switch a saved calibration off.
        if self.using_correction {
            commands.push(s.correction_on().to_string());
        }

        self.write_all(&commands).await?;
        self.frequencies = Some(frequencies.clone());
        info!(
            points = frequencies.count(),
            averaging, if_bandwidth, "Analyzer configured"
        );
        Ok(())
    }

    /// Select `kind`, which restarts averaging on the analyzer.
    pub async fn rst_avg(&mut self, kind: MeasurementKind) -> AppResult<()> {
        self.write(self.syntax.select_parameter(kind)).await
    }

    /// Pull the current trace and tag it with the given position.
    pub async fn get_data(
        &mut self,
        theta: f64,
        phi: f64,
        kind: MeasurementKind,
    ) -> AppResult<Vec<MeasurementSample>> {
        let frequencies = self
            .frequencies
            .as_ref()
            .ok_or_else(|| DaqError::Instrument("get_data called before setup".to_string()))?
            .frequencies();

        let s = self.syntax;
        for command in [
            s.display_data_and_memory(),
            s.polar_format(),
            s.polar_log_marker(),
            s.auto_scale(),
            s.data_to_memory(),
            s.output_formatted_data(),
        ] {
            self.write(command).await?;
        }

        let len = TRACE_HEADER_LEN + TRACE_POINT_LEN * frequencies.len();
        let bytes = self.transport.read_bytes(len).await?;
        let pairs = decode_trace(&bytes, frequencies.len())?;

        Ok(frequencies
            .iter()
            .zip(pairs)
            .map(|(&freq, (re, im))| {
                let (re, im) = (f64::from(re), f64::from(im));
                MeasurementSample {
                    kind,
                    freq,
                    theta,
                    phi,
                    magnitude: magnitude_db(re, im),
                    phase: phase_degrees(re, im),
                }
            })
            .collect())
    }

    /// First calibration stage. Fit the open standard before calling.
    pub async fn calibrate_open(&mut self) -> AppResult<()> {
        self.write(self.syntax.calibrate_one_port()).await?;
        self.write(self.syntax.calibrate_open()).await
    }

    /// Second calibration stage. Fit the short standard before calling.
    pub async fn calibrate_short(&mut self) -> AppResult<()> {
        self.write(self.syntax.calibrate_short()).await
    }

    /// Last stage: measure the load, save the calibration and enable correction.
    pub async fn calibrate_load(&mut self) -> AppResult<()> {
        self.write(self.syntax.calibrate_load()).await?;
        self.write(self.syntax.save_one_port_calibration()).await?;
        self.write(self.syntax.correction_on()).await?;
        self.using_correction = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::mock::SimulatedVna;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn phase_quadrants() {
        assert!(close(phase_degrees(1.0, 0.0), 0.0));
        assert!(close(phase_degrees(0.0, 1.0), 90.0));
        assert!(close(phase_degrees(-1.0, 0.0), 180.0));
        assert!(close(phase_degrees(0.0, -1.0), -90.0));
        assert!(close(phase_degrees(-1.0, 1.0), 135.0));
        assert!(close(phase_degrees(1.0, 1.0), 45.0));
        assert!(close(phase_degrees(1.0, -1.0), -45.0));
        // Third quadrant lands at -135, same as atan2.
        assert!(close(phase_degrees(-1.0, -1.0), -135.0));
    }

    #[test]
    fn magnitude_of_zero_is_finite() {
        let m = magnitude_db(0.0, 0.0);
        assert!(m.is_finite());
        assert!(m < -1000.0);
        assert!(close(magnitude_db(1.0, 0.0), 0.0));
        assert!((magnitude_db(0.1, 0.0) + 20.0).abs() < 1e-6);
    }

    #[test]
    fn decode_big_endian_pairs() {
        let mut bytes = vec![0xde, 0xad, 0xbe, 0xef];
        for v in [1.5_f32, -2.0, 0.25, 0.0] {
            bytes.extend_from_slice(&v.to_be_bytes());
        }
        let pairs = decode_trace(&bytes, 2).unwrap();
        assert_eq!(pairs, vec![(1.5, -2.0), (0.25, 0.0)]);
        assert!(decode_trace(&bytes, 3).is_err());
    }

    #[test]
    fn linear_frequencies_include_both_ends() {
        let linear = FrequencySpec::Linear {
            start: 1000.0,
            stop: 2000.0,
            points: 5,
        };
        assert_eq!(linear.frequencies(), vec![1000.0, 1250.0, 1500.0, 1750.0, 2000.0]);
        let single = FrequencySpec::Linear {
            start: 900.0,
            stop: 900.0,
            points: 1,
        };
        assert_eq!(single.frequencies(), vec![900.0]);
    }

    #[test]
    fn list_cap() {
        let ok = FrequencySpec::List(vec![1000.0; 30]);
        assert!(ok.validate().is_ok());
        let too_many = FrequencySpec::List(vec![1000.0; 31]);
        assert!(matches!(
            too_many.validate(),
            Err(DaqError::Configuration(_))
        ));
    }

    async fn session(vna: &SimulatedVna) -> VnaSession {
        VnaSession::open(Box::new(vna.clone())).await.unwrap()
    }

    #[tokio::test]
    async fn setup_reenables_saved_calibration() {
        let vna = SimulatedVna::new();
        let mut session = session(&vna).await;
        session.reset_all().await.unwrap();

        session.calibrate_open().await.unwrap();
        session.calibrate_short().await.unwrap();
        assert!(!session.using_correction());
        session.calibrate_load().await.unwrap();
        assert!(session.using_correction());

        vna.clear_commands();
        let freqs = FrequencySpec::List(vec![1000.0, 2000.0]);
        session.setup(&freqs, 4, 3000).await.unwrap();
        let commands = vna.commands();
        assert_eq!(commands.last().map(String::as_str), Some("CORRON"));
    }

    #[tokio::test]
    async fn setup_without_calibration_leaves_correction_alone() {
        let vna = SimulatedVna::new();
        let mut session = session(&vna).await;
        session.reset().await.unwrap();

        vna.clear_commands();
        let freqs = FrequencySpec::List(vec![1000.0]);
        session.setup(&freqs, 1, 3700).await.unwrap();
        assert!(!vna.commands().iter().any(|c| c == "CORRON"));

        // A preset drops any earlier calibration.
        session.calibrate_open().await.unwrap();
        session.calibrate_short().await.unwrap();
        session.calibrate_load().await.unwrap();
        session.reset_all().await.unwrap();
        vna.clear_commands();
        session.setup(&freqs, 1, 3700).await.unwrap();
        assert!(!vna.commands().iter().any(|c| c == "CORRON"));
    }
}
