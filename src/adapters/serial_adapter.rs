//! Serial transport for the QPT positioner.
//!
//! The positioner talks 8N1 with no flow control. Frames are terminated by ETX,
//! which never appears unescaped inside a frame, so reading stops at the first
//! ETX after an STX. Anything that arrives after the terminator is kept for the
//! next read.

use super::PositionerTransport;
use crate::hardware::qpt::packet::{ETX, STX};
use anyhow::Result;
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use std::time::Duration;

#[cfg(feature = "tokio_serial")]
use anyhow::Context;
#[cfg(feature = "tokio_serial")]
use tokio::io::{AsyncReadExt, AsyncWriteExt};
#[cfg(feature = "tokio_serial")]
use tokio_serial::{SerialPortBuilderExt, SerialStream};
#[cfg(feature = "tokio_serial")]
use tracing::{debug, trace};

/// Silence on the line that ends a drain of the receive side.
#[cfg(feature = "tokio_serial")]
const DRAIN_QUIET: Duration = Duration::from_millis(5);

/// Serial link to the positioner.
pub struct SerialTransport {
    port_name: String,
    #[cfg(feature = "tokio_serial")]
    port: SerialStream,
    pending: BytesMut,
}

impl SerialTransport {
    /// Open `port_name` at `baud_rate`, 8N1, no flow control.
    ///
    /// # Errors
    /// Returns error if the port cannot be opened or serial support is compiled out.
    #[cfg(feature = "tokio_serial")]
    pub fn open(port_name: &str, baud_rate: u32) -> Result<Self> {
        let port = tokio_serial::new(port_name, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .with_context(|| format!("Failed to open positioner port {port_name} at {baud_rate} baud"))?;

        debug!(port = port_name, baud_rate, "Positioner serial port opened");
        Ok(Self {
            port_name: port_name.to_string(),
            port,
            pending: BytesMut::with_capacity(64),
        })
    }

    /// Always fails: serial support is compiled out.
    #[cfg(not(feature = "tokio_serial"))]
    pub fn open(port_name: &str, _baud_rate: u32) -> Result<Self> {
        Err(anyhow::anyhow!(
            "Cannot open {port_name}: serial support not enabled. Rebuild with --features tokio_serial"
        ))
    }

    /// Device path this transport was opened on.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

#[cfg(feature = "tokio_serial")]
#[async_trait]
impl PositionerTransport for SerialTransport {
    async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.port
            .write_all(frame)
            .await
            .with_context(|| format!("Positioner write failed on {}", self.port_name))?;
        trace!(bytes = ?frame, "QPT tx");
        Ok(())
    }

    async fn read_frame(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut buf = [0u8; 64];

        loop {
            if let Some(frame) = take_frame(&mut self.pending) {
                trace!(bytes = ?frame, "QPT rx");
                return Ok(Some(frame));
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            match tokio::time::timeout(remaining, self.port.read(&mut buf)).await {
                Ok(Ok(0)) => return Ok(None),
                Ok(Ok(n)) => self.pending.extend_from_slice(&buf[..n]),
                Ok(Err(e)) => {
                    return Err(e).with_context(|| format!("Positioner read failed on {}", self.port_name))
                }
                Err(_) => return Ok(None),
            }
        }
    }

    /// Flush the driver's receive buffer, then read off anything still in
    /// flight so a late reply cannot answer the next request.
    async fn clear_input(&mut self) -> Result<()> {
        use tokio_serial::SerialPort;
        self.port
            .clear(tokio_serial::ClearBuffer::Input)
            .with_context(|| format!("Failed to flush positioner input on {}", self.port_name))?;
        let dropped = drain_input(&mut self.port, &mut self.pending, DRAIN_QUIET)
            .await
            .with_context(|| format!("Positioner read failed on {}", self.port_name))?;
        if dropped > 0 {
            debug!(dropped, "Discarded stale positioner bytes");
        }
        Ok(())
    }
}

#[cfg(not(feature = "tokio_serial"))]
#[async_trait]
impl PositionerTransport for SerialTransport {
    async fn write_frame(&mut self, _frame: &[u8]) -> Result<()> {
        Err(anyhow::anyhow!("Serial support not enabled"))
    }

    async fn read_frame(&mut self, _timeout: Duration) -> Result<Option<Vec<u8>>> {
        self.pending.clear();
        Err(anyhow::anyhow!("Serial support not enabled"))
    }
}

/// Pull the first complete `STX .. ETX` frame out of `buffer`.
///
/// Bytes before the first STX are line noise and discarded.
pub(crate) fn take_frame(buffer: &mut BytesMut) -> Option<Vec<u8>> {
    let Some(start) = buffer.iter().position(|&b| b == STX) else {
        buffer.clear();
        return None;
    };
    buffer.advance(start);
    let end = buffer.iter().position(|&b| b == ETX)?;
    Some(buffer.split_to(end + 1).to_vec())
}

/// Empty `pending` and read from `reader` until it stays quiet for `quiet`.
///
/// Returns how many bytes were thrown away.
#[cfg(any(test, feature = "tokio_serial"))]
pub(crate) async fn drain_input<R>(
    reader: &mut R,
    pending: &mut BytesMut,
    quiet: Duration,
) -> std::io::Result<usize>
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;
    let mut dropped = pending.len();
    pending.clear();
    let mut buf = [0u8; 64];
    loop {
        match tokio::time::timeout(quiet, reader.read(&mut buf)).await {
            Ok(Ok(0)) | Err(_) => return Ok(dropped),
            Ok(Ok(n)) => dropped += n,
            Ok(Err(e)) => return Err(e),
        }
    }
}

/// Names of the serial ports present on this machine.
#[cfg(feature = "instrument_serial")]
pub fn list_ports() -> Result<Vec<String>> {
    use anyhow::Context;
    let ports = serialport::available_ports().context("Failed to enumerate serial ports")?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}

/// Always fails: port enumeration is compiled out.
#[cfg(not(feature = "instrument_serial"))]
pub fn list_ports() -> Result<Vec<String>> {
    Err(anyhow::anyhow!(
        "Serial support not enabled. Rebuild with --features instrument_serial"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_frame_splits_on_etx() {
        let mut buf = BytesMut::from(&[0xaa, STX, 0x35, 0x35, ETX, STX, 0x70][..]);
        assert_eq!(take_frame(&mut buf), Some(vec![STX, 0x35, 0x35, ETX]));
        assert_eq!(&buf[..], &[STX, 0x70]);
        assert_eq!(take_frame(&mut buf), None);
        buf.extend_from_slice(&[0x70, ETX]);
        assert_eq!(take_frame(&mut buf), Some(vec![STX, 0x70, 0x70, ETX]));
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn drain_drops_a_late_reply() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (mut device, mut host) = tokio::io::duplex(64);
        let mut pending = BytesMut::from(&[STX, 0x31][..]);
        // Reply to a request that already timed out.
        device.write_all(&[0x32, ETX, STX, 0x35, 0x35, ETX]).await.unwrap();

        let dropped = drain_input(&mut host, &mut pending, Duration::from_millis(5))
            .await
            .unwrap();
        assert_eq!(dropped, 8);
        assert!(pending.is_empty());

        device.write_all(&[STX, 0x70, 0x70, ETX]).await.unwrap();
        let mut buf = [0u8; 16];
        let n = host.read(&mut buf).await.unwrap();
        pending.extend_from_slice(&buf[..n]);
        assert_eq!(take_frame(&mut pending), Some(vec![STX, 0x70, 0x70, ETX]));
    }

    #[test]
    fn take_frame_discards_noise() {
        let mut buf = BytesMut::from(&[0x00, 0x11, ETX][..]);
        assert_eq!(take_frame(&mut buf), None);
        assert!(buf.is_empty());
    }
}
