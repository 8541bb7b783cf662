//! VISA transport for GPIB/USB/Ethernet instruments
//!
//! Wraps a visa-rs session and moves every blocking call onto Tokio's blocking
//! pool. Supports resource strings like:
//! - "GPIB0::16::INSTR" (GPIB interface, the usual VNA hookup)
//! - "TCPIP0::192.168.1.100::INSTR" (Ethernet/LXI)

use super::InstrumentTransport;
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

#[cfg(feature = "instrument_visa")]
use anyhow::{anyhow, Context};
#[cfg(feature = "instrument_visa")]
use std::sync::{Arc, Mutex};
#[cfg(feature = "instrument_visa")]
use tracing::debug;
#[cfg(feature = "instrument_visa")]
use visa_rs::prelude::*;

/// Resource string for a GPIB primary address on board 0.
pub fn gpib_resource(address: u8) -> String {
    format!("GPIB0::{address}::INSTR")
}

/// VISA session with a bench instrument.
pub struct VisaTransport {
    resource_string: String,
    timeout: Duration,
    line_terminator: String,
    #[cfg(feature = "instrument_visa")]
    session: Arc<Mutex<VisaSession>>,
}

#[cfg(feature = "instrument_visa")]
struct VisaSession {
    // Keeps the resource manager alive for as long as the instrument.
    _rm: DefaultRM,
    instrument: Instrument,
}

impl VisaTransport {
    /// Open `resource_string`.
    ///
    /// # Errors
    /// Returns error if the resource cannot be opened or VISA support is compiled out.
    #[cfg(feature = "instrument_visa")]
    pub async fn open(resource_string: &str, timeout: Duration) -> Result<Self> {
        let resource = resource_string.to_string();
        let session = tokio::task::spawn_blocking(move || -> Result<VisaSession> {
            let rm = DefaultRM::new().context("Failed to create VISA resource manager")?;
            let c_string =
                std::ffi::CString::new(resource.as_str()).context("Failed to create CString")?;
            let visa_string = visa_rs::VisaString::from(c_string);
            let instrument = rm
                .open(&visa_string, AccessMode::NO_LOCK, TIMEOUT_IMMEDIATE)
                .with_context(|| format!("Failed to open VISA resource {resource}"))?;
            Ok(VisaSession {
                _rm: rm,
                instrument,
            })
        })
        .await
        .context("VISA open task panicked")??;

        debug!(resource = resource_string, "VISA session opened");
        Ok(Self {
            resource_string: resource_string.to_string(),
            timeout,
            line_terminator: "\n".to_string(),
            session: Arc::new(Mutex::new(session)),
        })
    }

    /// Always fails: VISA support is compiled out.
    #[cfg(not(feature = "instrument_visa"))]
    pub async fn open(resource_string: &str, _timeout: Duration) -> Result<Self> {
        Err(anyhow::anyhow!(
            "Cannot open {resource_string}: VISA support not enabled. Rebuild with --features instrument_visa"
        ))
    }

    /// Set line terminator for commands
    pub fn with_line_terminator(mut self, terminator: &str) -> Self {
        self.line_terminator = terminator.to_string();
        self
    }

    /// VISA resource this session was opened on.
    pub fn resource_string(&self) -> &str {
        &self.resource_string
    }

    /// Per-operation timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[cfg(feature = "instrument_visa")]
    async fn with_session<R, F>(&self, op: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Instrument) -> Result<R> + Send + 'static,
    {
        let session = Arc::clone(&self.session);
        let timeout = self.timeout;
        let call = tokio::task::spawn_blocking(move || {
            let mut guard = session
                .lock()
                .map_err(|_| anyhow!("VISA session lock poisoned"))?;
            op(&mut guard.instrument)
        });
        match tokio::time::timeout(timeout, call).await {
            Ok(joined) => joined.context("VISA I/O task panicked")?,
            Err(_) => Err(anyhow!("VISA operation timed out after {:?}", timeout)),
        }
    }
}

#[cfg(feature = "instrument_visa")]
#[async_trait]
impl InstrumentTransport for VisaTransport {
    async fn write(&mut self, command: &str) -> Result<()> {
        use std::io::Write;
        let line = format!("{command}{}", self.line_terminator);
        let for_log = command.to_string();
        self.with_session(move |instr| {
            instr
                .write_all(line.as_bytes())
                .with_context(|| format!("VISA write failed for: {for_log}"))
        })
        .await?;
        debug!(command, "VISA write");
        Ok(())
    }

    async fn query(&mut self, command: &str) -> Result<String> {
        use std::io::{Read, Write};
        let line = format!("{command}{}", self.line_terminator);
        let for_log = command.to_string();
        let response = self
            .with_session(move |instr| {
                instr
                    .write_all(line.as_bytes())
                    .with_context(|| format!("VISA query failed for: {for_log}"))?;
                let mut buf = [0u8; 1024];
                let n = instr
                    .read(&mut buf)
                    .with_context(|| format!("VISA read failed for: {for_log}"))?;
                Ok(String::from_utf8_lossy(&buf[..n]).trim().to_string())
            })
            .await?;
        debug!(command, response = %response, "VISA query");
        Ok(response)
    }

    async fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        use std::io::Read;
        self.with_session(move |instr| {
            let mut buf = vec![0u8; len];
            instr
                .read_exact(&mut buf)
                .with_context(|| format!("VISA binary read of {len} bytes failed"))?;
            Ok(buf)
        })
        .await
    }
}

#[cfg(not(feature = "instrument_visa"))]
#[async_trait]
impl InstrumentTransport for VisaTransport {
    async fn write(&mut self, _command: &str) -> Result<()> {
        Err(anyhow::anyhow!("VISA support not enabled"))
    }

    async fn query(&mut self, _command: &str) -> Result<String> {
        Err(anyhow::anyhow!("VISA support not enabled"))
    }

    async fn read_bytes(&mut self, _len: usize) -> Result<Vec<u8>> {
        Err(anyhow::anyhow!("VISA support not enabled"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpib_resource_string() {
        assert_eq!(gpib_resource(16), "GPIB0::16::INSTR");
    }

    #[cfg(not(feature = "instrument_visa"))]
    #[tokio::test]
    async fn open_without_feature_fails() {
        let err = VisaTransport::open("GPIB0::16::INSTR", Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("instrument_visa"));
    }
}
