//! Measurement records and where they go.
//!
//! - [`sample`]: one S-parameter reading at one frequency and position
//! - [`sink`]: append-only output, CSV on disk or an in-memory buffer

pub mod sample;
pub mod sink;

pub use sample::{MeasurementKind, MeasurementSample};
pub use sink::{output_file_name, CsvSink, MemorySink, SampleSink, SinkRow, CSV_HEADER, SENTINEL};
