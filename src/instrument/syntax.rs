//! Network analyzer command syntax.
//!
//! Each supported model gets one [`CommandSyntax`] implementation. The session
//! only ever asks for actions ("select S21", "add a list segment at f"), so a
//! new analyzer is supported by adding a table here and a row in
//! [`MODEL_SIGNATURES`]; nothing above the session changes.
//!
//! Argument validation lives with the syntax because the limits are per model.

use crate::error::{AppResult, DaqError};
use crate::measurement::MeasurementKind;

/// Supported analyzer models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Model {
    /// HP/Agilent 8753D.
    Hp8753d,
}

/// Substring of the `*IDN?` reply that identifies each model.
pub const MODEL_SIGNATURES: &[(&str, Model)] = &[("8753D", Model::Hp8753d)];

impl Model {
    /// Match an identification string against [`MODEL_SIGNATURES`].
    pub fn identify(idn: &str) -> AppResult<Self> {
        MODEL_SIGNATURES
            .iter()
            .find(|(signature, _)| idn.contains(signature))
            .map(|(_, model)| *model)
            .ok_or_else(|| DaqError::UnsupportedModel(idn.trim().to_string()))
    }

    /// Command table for this model.
    pub fn syntax(self) -> &'static dyn CommandSyntax {
        match self {
            Model::Hp8753d => &Hp8753d,
        }
    }
}

/// Command strings for one analyzer model.
pub trait CommandSyntax: Send + Sync {
    /// Model name for logs.
    fn name(&self) -> &'static str;

    /// Factory preset. Discards calibration.
    fn preset(&self) -> &'static str;
    /// Binary transfer format for trace dumps (32-bit big-endian floats).
    fn binary_format(&self) -> &'static str;

    /// Open the frequency list for editing.
    fn edit_list(&self) -> &'static str;
    /// Delete every list segment.
    fn clear_list(&self) -> &'static str;
    /// Add a single-point list segment at `khz`.
    fn add_list_frequency(&self, khz: u64) -> AppResult<String>;
    /// Sweep the frequency list.
    fn list_mode(&self) -> &'static str;

    /// Linear sweep start.
    fn linear_start(&self, khz: u64) -> AppResult<String>;
    /// Linear sweep stop.
    fn linear_stop(&self, khz: u64) -> AppResult<String>;
    /// Linear sweep point count.
    fn linear_points(&self, points: u32) -> AppResult<String>;
    /// Sweep linearly.
    fn linear_mode(&self) -> &'static str;

    /// Averaging factor.
    fn averaging_factor(&self, factor: u32) -> AppResult<String>;
    /// Enable averaging.
    fn averaging_on(&self) -> &'static str;
    /// Restart averaging.
    fn averaging_restart(&self) -> &'static str;
    /// IF bandwidth.
    fn if_bandwidth(&self, hz: u32) -> AppResult<String>;

    /// Select the measured parameter. Also restarts averaging.
    fn select_parameter(&self, kind: MeasurementKind) -> &'static str;

    /// Show data and memory traces.
    fn display_data_and_memory(&self) -> &'static str;
    /// Polar display format.
    fn polar_format(&self) -> &'static str;
    /// Log magnitude and phase markers in polar format.
    fn polar_log_marker(&self) -> &'static str;
    /// Autoscale the display.
    fn auto_scale(&self) -> &'static str;
    /// Copy the trace to memory.
    fn data_to_memory(&self) -> &'static str;
    /// Dump the formatted trace in the binary format.
    fn output_formatted_data(&self) -> &'static str;

    /// Start a one-port calibration.
    fn calibrate_one_port(&self) -> &'static str;
    /// Measure the open standard.
    fn calibrate_open(&self) -> &'static str;
    /// Measure the short standard.
    fn calibrate_short(&self) -> &'static str;
    /// Measure the load standard.
    fn calibrate_load(&self) -> &'static str;
    /// Save the one-port calibration.
    fn save_one_port_calibration(&self) -> &'static str;
    /// Enable error correction.
    fn correction_on(&self) -> &'static str;
}

/// HP/Agilent 8753D.
#[derive(Debug, Clone, Copy, Default)]
pub struct Hp8753d;

impl Hp8753d {
    /// Lowest frequency, kHz.
    pub const MIN_FREQ_KHZ: u64 = 30;
    /// Highest frequency, kHz.
    pub const MAX_FREQ_KHZ: u64 = 6_000_000;
    /// Most points in a linear sweep.
    pub const MAX_POINTS: u32 = 1632;
    /// Largest averaging factor.
    pub const MAX_AVERAGING: u32 = 999;
    /// Selectable IF bandwidths, Hz.
    pub const IF_BANDWIDTHS: [u32; 7] = [10, 30, 100, 300, 1000, 3000, 3700];
}

fn out_of_range(what: &str, value: impl std::fmt::Display) -> DaqError {
    DaqError::Configuration(format!("{what} is not valid for the HP 8753D: {value}"))
}

impl CommandSyntax for Hp8753d {
    fn name(&self) -> &'static str {
        "HP 8753D"
    }

    fn preset(&self) -> &'static str {
        "PRES"
    }

    fn binary_format(&self) -> &'static str {
        "FORM2"
    }

    fn edit_list(&self) -> &'static str {
        "EDITLIST"
    }

    fn clear_list(&self) -> &'static str {
        "CLEL"
    }

    fn add_list_frequency(&self, khz: u64) -> AppResult<String> {
        if !(Self::MIN_FREQ_KHZ..=Self::MAX_FREQ_KHZ).contains(&khz) {
            return Err(out_of_range("list frequency (kHz)", khz));
        }
        Ok(format!("SADD; CENT {khz} KHZ; SDON"))
    }

    fn list_mode(&self) -> &'static str {
        "LISFREQ"
    }

    fn linear_start(&self, khz: u64) -> AppResult<String> {
        // The start must leave room for at least one point below the top.
        if !(Self::MIN_FREQ_KHZ..Self::MAX_FREQ_KHZ).contains(&khz) {
            return Err(out_of_range("start frequency (kHz)", khz));
        }
        Ok(format!("STAR {khz} KHZ"))
    }

    fn linear_stop(&self, khz: u64) -> AppResult<String> {
        if !(Self::MIN_FREQ_KHZ..=Self::MAX_FREQ_KHZ).contains(&khz) {
            return Err(out_of_range("stop frequency (kHz)", khz));
        }
        Ok(format!("STOP {khz} KHZ"))
    }

    fn linear_points(&self, points: u32) -> AppResult<String> {
        if !(1..=Self::MAX_POINTS).contains(&points) {
            return Err(out_of_range("number of points", points));
        }
        Ok(format!("POIN {points}"))
    }

    fn linear_mode(&self) -> &'static str {
        "LINFREQ"
    }

    fn averaging_factor(&self, factor: u32) -> AppResult<String> {
        if !(1..=Self::MAX_AVERAGING).contains(&factor) {
            return Err(out_of_range("averaging factor", factor));
        }
        Ok(format!("AVERFACT {factor}"))
    }

    fn averaging_on(&self) -> &'static str {
        "AVERO1"
    }

    fn averaging_restart(&self) -> &'static str {
        "AVERREST"
    }

    fn if_bandwidth(&self, hz: u32) -> AppResult<String> {
        if !Self::IF_BANDWIDTHS.contains(&hz) {
            return Err(out_of_range("IF bandwidth (Hz)", hz));
        }
        Ok(format!("IFBW {hz} HZ"))
    }

    fn select_parameter(&self, kind: MeasurementKind) -> &'static str {
        match kind {
            MeasurementKind::S11 => "S11",
            MeasurementKind::S21 => "S21",
        }
    }

    fn display_data_and_memory(&self) -> &'static str {
        "DISPDATM"
    }

    fn polar_format(&self) -> &'static str {
        "POLA"
    }

    fn polar_log_marker(&self) -> &'static str {
        "POLMLOG"
    }

    fn auto_scale(&self) -> &'static str {
        "AUTO"
    }

    fn data_to_memory(&self) -> &'static str {
        "DATI"
    }

    fn output_formatted_data(&self) -> &'static str {
        "OUTPFORM"
    }

    fn calibrate_one_port(&self) -> &'static str {
        "CALIS111"
    }

    fn calibrate_open(&self) -> &'static str {
        "CLASS11A"
    }

    fn calibrate_short(&self) -> &'static str {
        "CLASS11B"
    }

    fn calibrate_load(&self) -> &'static str {
        "CLASS11C"
    }

    fn save_one_port_calibration(&self) -> &'static str {
        "SAV1"
    }

    fn correction_on(&self) -> &'static str {
        "CORRON"
    }
}
