//! Sample sinks.
//!
//! The CSV file is the hand-off to the plotting side, which polls it while a
//! sweep runs. Rows are flushed as soon as they are written, and a row of
//! `null`s marks the end of a sweep (finished or stopped). A file without that
//! row is still being written.

use super::sample::MeasurementSample;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::info;

/// Column names, first line of every measurement file.
pub const CSV_HEADER: [&str; 6] = ["measurement_type", "freq", "theta", "phi", "magnitude", "phase"];
/// Last line of a finished or stopped sweep.
pub const SENTINEL: [&str; 6] = ["null"; 6];

/// Destination for measurement rows.
#[async_trait]
pub trait SampleSink: Send {
    /// Append one trace.
    async fn write(&mut self, samples: &[MeasurementSample]) -> Result<()>;

    /// Append the end-of-sweep marker.
    async fn terminate(&mut self) -> Result<()>;
}

/// File name for a sweep started at `now`, e.g. `Mar14_0932_05.csv`.
pub fn output_file_name(now: chrono::DateTime<chrono::Local>) -> String {
    format!("{}.csv", now.format("%b%d_%H%M_%S"))
}

/// CSV file sink.
pub struct CsvSink {
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl CsvSink {
    /// Create (or truncate) `path` and write the header row.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create output directory {}", parent.display()))?;
        }
        let file = File::create(&path)
            .with_context(|| format!("Failed to create CSV file at {}", path.display()))?;
        let mut writer = csv::Writer::from_writer(file);
        writer
            .write_record(CSV_HEADER)
            .context("Failed to write CSV header")?;
        writer.flush().context("Failed to flush CSV header")?;
        info!(path = %path.display(), "Measurement file created");
        Ok(Self { path, writer })
    }

    /// Reopen an existing file for appending, without a new header.
    pub fn append_to(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open CSV file at {}", path.display()))?;
        Ok(Self {
            path,
            writer: csv::Writer::from_writer(file),
        })
    }

    /// File being written.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SampleSink for CsvSink {
    async fn write(&mut self, samples: &[MeasurementSample]) -> Result<()> {
        for sample in samples {
            self.writer
                .write_record(sample.to_record())
                .context("Failed to write sample to CSV file")?;
        }
        self.writer.flush().context("Failed to flush CSV writer")?;
        Ok(())
    }

    async fn terminate(&mut self) -> Result<()> {
        self.writer
            .write_record(SENTINEL)
            .context("Failed to write end-of-sweep marker")?;
        self.writer.flush().context("Failed to flush CSV writer")?;
        Ok(())
    }
}

/// One row held by [`MemorySink`].
#[derive(Debug, Clone, PartialEq)]
pub enum SinkRow {
    /// A measured point.
    Sample(MeasurementSample),
    /// The end-of-sweep marker.
    End,
}

/// In-memory sink; clones share the same rows.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    rows: Arc<Mutex<Vec<SinkRow>>>,
}

impl MemorySink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written, in order.
    pub fn rows(&self) -> Vec<SinkRow> {
        self.rows
            .lock()
            .map(|rows| rows.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Samples only, markers dropped.
    pub fn samples(&self) -> Vec<MeasurementSample> {
        self.rows()
            .into_iter()
            .filter_map(|row| match row {
                SinkRow::Sample(s) => Some(s),
                SinkRow::End => None,
            })
            .collect()
    }

    /// Whether the last row is the end marker.
    pub fn is_terminated(&self) -> bool {
        matches!(self.rows().last(), Some(SinkRow::End))
    }

    fn push(&self, row: SinkRow) {
        match self.rows.lock() {
            Ok(mut rows) => rows.push(row),
            Err(poisoned) => poisoned.into_inner().push(row),
        }
    }
}

#[async_trait]
impl SampleSink for MemorySink {
    async fn write(&mut self, samples: &[MeasurementSample]) -> Result<()> {
        for sample in samples {
            self.push(SinkRow::Sample(*sample));
        }
        Ok(())
    }

    async fn terminate(&mut self) -> Result<()> {
        self.push(SinkRow::End);
        Ok(())
    }
}
