//! Transport trait for delivering G-code to a device.
//!
//! The motion queue talks to the device exclusively through [`Transport`], so
//! the drain loop works the same against a TCP-attached printer
//! ([`GcodeTransport`](crate::gcode_client::GcodeTransport)), the
//! [`DryRunTransport`] used for rehearsals, or a test double.

use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

/// G-code that blocks until all buffered moves have finished.
pub const MOTION_COMPLETE_GCODE: &str = "M400";

/// Errors reported by a transport.
#[derive(Error, Debug)]
pub enum TransportError {
    /// No open connection to the device.
    #[error("not connected to device")]
    NotConnected,

    /// Failed to establish a connection.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The device closed the connection.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The device answered with an error line.
    #[error("device error: {0}")]
    Device(String),

    /// A connect or read exceeded its timeout.
    #[error("operation timed out")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A device link that accepts one G-code line at a time.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one line and wait until the device accepts it.
    ///
    /// Returns the reply lines received before the acknowledgment.
    async fn submit(&self, line: &str) -> Result<Vec<String>, TransportError>;

    /// Wait until the device reports that buffered motion has finished.
    async fn wait_motion_complete(&self) -> Result<(), TransportError> {
        self.submit(MOTION_COMPLETE_GCODE).await.map(|_| ())
    }

    /// Discard any reply still owed for an abandoned command.
    ///
    /// Called after a command exceeded the acknowledgment timeout, so a late
    /// reply is never taken as the answer to the next command.
    async fn reset(&self) {}

    /// Short label used in logs.
    fn name(&self) -> &str;
}

/// Transport that logs G-code instead of sending it.
#[derive(Debug, Default)]
pub struct DryRunTransport {
    sent: Mutex<Vec<String>>,
}

impl DryRunTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every line submitted so far, in order.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Transport for DryRunTransport {
    async fn submit(&self, line: &str) -> Result<Vec<String>, TransportError> {
        info!(gcode = line, "dry run");
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(line.to_string());
        }
        Ok(Vec::new())
    }

    fn name(&self) -> &str {
        "dry-run"
    }
}
