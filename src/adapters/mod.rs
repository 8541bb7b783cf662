//! Transport adapters
//!
//! Two links are driven by this crate: the RS-232/RS-485 line to the QPT
//! positioner, which carries binary frames, and the GPIB/VISA session to the
//! network analyzer, which carries text commands and binary trace dumps. Each
//! gets a small async trait so drivers can be exercised against simulated
//! hardware.

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

pub mod serial_adapter;
pub mod visa_adapter;

pub use serial_adapter::{list_ports, SerialTransport};
pub use visa_adapter::VisaTransport;

/// Byte-oriented link to the positioner.
#[async_trait]
pub trait PositionerTransport: Send {
    /// Write one complete frame.
    async fn write_frame(&mut self, frame: &[u8]) -> Result<()>;

    /// Read one frame up to and including ETX.
    ///
    /// `Ok(None)` means nothing complete arrived within `timeout`. That is not
    /// an error, the caller decides whether to retry.
    async fn read_frame(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>>;

    /// Drop anything buffered from earlier exchanges.
    async fn clear_input(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Text/binary session with a bench instrument.
#[async_trait]
pub trait InstrumentTransport: Send {
    /// Send one command line.
    async fn write(&mut self, command: &str) -> Result<()>;

    /// Send a command and return the trimmed text reply.
    async fn query(&mut self, command: &str) -> Result<String>;

    /// Read exactly `len` raw bytes (binary block transfers).
    async fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>>;
}
