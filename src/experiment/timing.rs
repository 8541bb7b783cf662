//! Analyzer timing and continuous-sweep speed planning.
//!
//! The delay table holds measured settling times of the HP 8753D for a given
//! trace size and averaging factor. They are firmware specific and have no
//! derivation, so the table is plain data: it deserializes from the
//! `[vna_timing]` configuration section and [`TimingTable::default`] carries
//! the values measured on the bench instrument.

use super::config::SweepAxis;
use crate::instrument::FrequencySpec;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Averaging factors up to this use the `avg_low` column.
pub const LOW_AVERAGING_MAX: u32 = 8;

/// Delays for one sweep, seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VnaDelays {
    /// Wait after an averaging restart before the trace is read.
    pub avg: f64,
    /// Time to take one S11 trace.
    pub s11: f64,
    /// Time to take one S21 trace.
    pub s21: f64,
}

impl VnaDelays {
    /// [`avg`](Self::avg) as a duration, never negative.
    pub fn avg_duration(&self) -> Duration {
        Duration::from_secs_f64(self.avg.max(0.0))
    }
}

/// One row: applies to traces of at most `up_to` points.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DelayRow {
    /// Largest point count this row covers.
    pub up_to: usize,
    /// Averaging delay for factors up to [`LOW_AVERAGING_MAX`].
    pub avg_low: f64,
    /// Averaging delay for larger factors.
    pub avg_high: f64,
    /// S11 trace time.
    pub s11: f64,
    /// S21 trace time.
    pub s21: f64,
}

const fn row(up_to: usize, avg_low: f64, avg_high: f64, s11: f64, s21: f64) -> DelayRow {
    DelayRow {
        up_to,
        avg_low,
        avg_high,
        s11,
        s21,
    }
}

/// Delay lookup keyed by trace size and averaging factor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingTable {
    /// Rows for list sweeps, ascending `up_to`.
    pub list: Vec<DelayRow>,
    /// Rows for linear sweeps, ascending `up_to`.
    pub linear: Vec<DelayRow>,
}

impl Default for TimingTable {
    fn default() -> Self {
        Self {
            list: vec![
                row(5, 2.19, 3.98, 1.202, 1.26),
                row(10, 3.02, 5.80, 1.296, 1.35),
                row(15, 3.11, 5.95, 1.36, 1.42),
                row(20, 3.36, 6.48, 1.417, 1.489),
                row(25, 3.26, 6.35, 1.477, 1.547),
                row(usize::MAX, 3.58, 6.76, 1.52, 1.61),
            ],
            linear: vec![
                row(201, 3.79, 7.30, 1.71, 2.03),
                row(401, 4.23, 7.99, 2.15, 2.73),
                row(801, 5.49, 10.39, 3.01, 4.09),
                row(1601, 8.51, 16.06, 4.72, 6.74),
            ],
        }
    }
}

impl TimingTable {
    /// Every row set to the same delays. Handy for simulated runs.
    pub fn uniform(delays: VnaDelays) -> Self {
        let r = row(usize::MAX, delays.avg, delays.avg, delays.s11, delays.s21);
        Self {
            list: vec![r],
            linear: vec![r],
        }
    }

    /// Look up the delays for a sweep.
    ///
    /// Traces larger than the last row use the last row. An empty table gives
    /// zero delays.
    pub fn delays(&self, frequencies: &FrequencySpec, averaging: u32) -> VnaDelays {
        let rows = match frequencies {
            FrequencySpec::List(_) => &self.list,
            FrequencySpec::Linear { .. } => &self.linear,
        };
        let count = frequencies.count();
        let Some(row) = rows.iter().find(|r| count <= r.up_to).or(rows.last()) else {
            return VnaDelays {
                avg: 0.0,
                s11: 0.0,
                s21: 0.0,
            };
        };
        let avg = if averaging <= LOW_AVERAGING_MAX {
            row.avg_low
        } else {
            row.avg_high
        };
        VnaDelays {
            avg,
            s11: row.s11,
            s21: row.s21,
        }
    }
}

/// Time budget and jog speed law of one axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisSpeedLaw {
    /// Longest continuous sweep the axis can run at its minimum speed.
    pub time_budget: f64,
    /// Slowest jog speed the axis accepts.
    pub min_speed: u8,
    /// Fastest jog speed.
    pub max_speed: u8,
    gain: f64,
    intercept: f64,
}

/// Pan axis, fitted on the bench.
pub const PAN_SPEED_LAW: AxisSpeedLaw = AxisSpeedLaw {
    time_budget: 1240.0,
    min_speed: 8,
    max_speed: 127,
    gain: 12.8866,
    intercept: 3.1546,
};

/// Tilt axis, fitted on the bench.
pub const TILT_SPEED_LAW: AxisSpeedLaw = AxisSpeedLaw {
    time_budget: 700.0,
    min_speed: 17,
    max_speed: 127,
    gain: 39.3701,
    intercept: 6.8228,
};

impl AxisSpeedLaw {
    /// Law for `axis`.
    pub fn for_axis(axis: SweepAxis) -> Self {
        match axis {
            SweepAxis::Pan => PAN_SPEED_LAW,
            SweepAxis::Tilt => TILT_SPEED_LAW,
        }
    }

    /// Jog speed that covers `degrees` in `total_time`, clamped to the axis.
    pub fn speed(&self, degrees: f64, total_time: f64) -> u8 {
        if total_time <= 0.0 {
            return self.max_speed;
        }
        let raw = (self.gain * (degrees / total_time) + self.intercept).trunc();
        raw.clamp(f64::from(self.min_speed), f64::from(self.max_speed)) as u8
    }
}

/// Outcome of the continuous-sweep feasibility check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ContinuousPlan {
    /// Jog at this speed.
    Jog { speed: u8, total_time: f64 },
    /// The sweep would take longer than the axis allows; step instead.
    TooSlow { total_time: f64, budget: f64 },
}

/// Decide whether a continuous sweep of `total_steps` fits the axis budget.
pub fn continuous_plan(axis: SweepAxis, delays: &VnaDelays, total_steps: u32) -> ContinuousPlan {
    let law = AxisSpeedLaw::for_axis(axis);
    let total_time = (delays.avg + delays.s21) * f64::from(total_steps);
    let plan = if total_time > law.time_budget {
        ContinuousPlan::TooSlow {
            total_time,
            budget: law.time_budget,
        }
    } else {
        ContinuousPlan::Jog {
            speed: law.speed(axis.full_range(), total_time),
            total_time,
        }
    };
    debug!(%axis, total_steps, ?plan, "Continuous sweep plan");
    plan
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delays(avg: f64, s21: f64) -> VnaDelays {
        VnaDelays { avg, s11: 0.0, s21 }
    }

    #[test]
    fn list_rows_by_count_and_averaging() {
        let table = TimingTable::default();
        let five = FrequencySpec::List(vec![1000.0; 5]);
        assert_eq!(table.delays(&five, 8).avg, 2.19);
        assert_eq!(table.delays(&five, 9).avg, 3.98);
        assert_eq!(table.delays(&five, 9).s21, 1.26);

        let six = FrequencySpec::List(vec![1000.0; 6]);
        assert_eq!(table.delays(&six, 1).avg, 3.02);

        let thirty = FrequencySpec::List(vec![1000.0; 30]);
        let d = table.delays(&thirty, 16);
        assert_eq!((d.avg, d.s11, d.s21), (6.76, 1.52, 1.61));
    }

    #[test]
    fn linear_rows_fall_back_to_last() {
        let table = TimingTable::default();
        let linear = |points| FrequencySpec::Linear {
            start: 100.0,
            stop: 200.0,
            points,
        };
        assert_eq!(table.delays(&linear(201), 4).avg, 3.79);
        assert_eq!(table.delays(&linear(202), 4).s21, 2.73);
        assert_eq!(table.delays(&linear(1601), 10).avg, 16.06);
        assert_eq!(table.delays(&linear(1632), 10).avg, 16.06);
    }

    #[test]
    fn table_is_replaceable() {
        let table: TimingTable = toml::from_str(
            r#"
            list = [{ up_to = 100, avg_low = 0.5, avg_high = 1.0, s11 = 0.1, s21 = 0.2 }]
            linear = []
            "#,
        )
        .unwrap();
        let three = FrequencySpec::List(vec![1000.0; 3]);
        assert_eq!(table.delays(&three, 20).avg, 1.0);
        let lin = FrequencySpec::Linear {
            start: 1.0,
            stop: 2.0,
            points: 3,
        };
        assert_eq!(table.delays(&lin, 20).avg, 0.0);
    }

    #[test]
    fn twelve_pan_steps_stay_continuous() {
        match continuous_plan(SweepAxis::Pan, &delays(6.0, 2.0), 12) {
            ContinuousPlan::Jog { speed, total_time } => {
                assert_eq!(total_time, 96.0);
                // 12.8866 * 3.75 + 3.1546 = 51.48
                assert_eq!(speed, 51);
            }
            other => panic!("expected a jog plan, got {other:?}"),
        }
    }

    #[test]
    fn one_degree_pan_steps_are_too_slow() {
        match continuous_plan(SweepAxis::Pan, &delays(6.0, 2.0), 360) {
            ContinuousPlan::TooSlow { total_time, budget } => {
                assert_eq!(total_time, 2880.0);
                assert_eq!(budget, 1240.0);
            }
            other => panic!("expected step fallback, got {other:?}"),
        }
    }

    #[test]
    fn speeds_clamp_to_axis_limits() {
        assert_eq!(PAN_SPEED_LAW.speed(360.0, 1200.0), 8);
        assert_eq!(PAN_SPEED_LAW.speed(360.0, 1.0), 127);
        assert_eq!(TILT_SPEED_LAW.speed(180.0, 700.0), 17);
        // 39.3701 * 2 + 6.8228 = 85.56
        assert_eq!(TILT_SPEED_LAW.speed(180.0, 90.0), 85);
        assert_eq!(TILT_SPEED_LAW.speed(180.0, 0.0), 127);
    }

    #[test]
    fn tilt_budget_is_tighter() {
        let d = delays(5.0, 1.0);
        assert!(matches!(
            continuous_plan(SweepAxis::Tilt, &d, 120),
            ContinuousPlan::TooSlow { .. }
        ));
        assert!(matches!(
            continuous_plan(SweepAxis::Pan, &d, 120),
            ContinuousPlan::Jog { .. }
        ));
    }
}
