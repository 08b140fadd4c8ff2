//! Shared test helpers for printloop-core integration tests.
//!
//! Provides a programmable G-code device over TCP and an in-process transport
//! that records what the motion queue sends.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use printloop_core::config::{PrintloopConfig, QueueConfig};
use printloop_core::live::Live;
use printloop_core::session::Session;
use printloop_core::transport::{Transport, TransportError};

// ---------------------------------------------------------------------------
// Mock G-code device
// ---------------------------------------------------------------------------

/// How the mock device answers one received line.
pub enum DeviceReply {
    /// Write these lines back, in order.
    Lines(Vec<String>),
    /// Write these lines back after a pause.
    Delayed(Duration, Vec<String>),
    /// Never answer.
    Silent,
    /// Close the connection without answering.
    Close,
}

pub fn ok() -> DeviceReply {
    DeviceReply::Lines(vec!["ok".to_string()])
}

/// A TCP device that serves every connection it accepts and answers each
/// line through a user-supplied function.
pub struct MockDevice {
    pub addr: SocketAddr,
    received: Arc<Mutex<Vec<String>>>,
}

impl MockDevice {
    pub async fn start<F>(respond: F) -> Self
    where
        F: Fn(&str) -> DeviceReply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let log = received.clone();
        let respond = Arc::new(respond);

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let (log, respond) = (log.clone(), respond.clone());
                tokio::spawn(async move {
                    let (read_half, mut write_half) = stream.into_split();
                    let mut lines = BufReader::new(read_half).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        log.lock().unwrap().push(line.clone());
                        let replies = match (*respond)(&line) {
                            DeviceReply::Lines(replies) => replies,
                            DeviceReply::Delayed(delay, replies) => {
                                tokio::time::sleep(delay).await;
                                replies
                            }
                            DeviceReply::Silent => continue,
                            DeviceReply::Close => break,
                        };
                        for reply in replies {
                            if write_half.write_all(format!("{}\n", reply).as_bytes()).await.is_err() {
                                return;
                            }
                        }
                        let _ = write_half.flush().await;
                    }
                });
            }
        });

        Self { addr, received }
    }

    /// Every line received so far, across connections.
    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }
}

// ---------------------------------------------------------------------------
// Recording transport
// ---------------------------------------------------------------------------

/// Transport double. Lines are recorded when submitted; lines containing a
/// configured pattern fail or never complete.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<String>>,
    delay: Duration,
    fail_on: Option<String>,
    hang_on: Option<String>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every submit takes `delay` before acknowledging.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing_on(mut self, pattern: &str) -> Self {
        self.fail_on = Some(pattern.to_string());
        self
    }

    pub fn hanging_on(mut self, pattern: &str) -> Self {
        self.hang_on = Some(pattern.to_string());
        self
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    /// Z coordinates of every `G0` line sent.
    pub fn z_moves(&self) -> Vec<f64> {
        self.sent()
            .iter()
            .filter(|l| l.starts_with("G0"))
            .filter_map(|l| {
                l.split_whitespace()
                    .find_map(|word| word.strip_prefix('Z'))
                    .and_then(|z| z.parse().ok())
            })
            .collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn submit(&self, line: &str) -> Result<Vec<String>, TransportError> {
        self.sent.lock().unwrap().push(line.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.hang_on.as_deref().is_some_and(|p| line.contains(p)) {
            std::future::pending::<()>().await;
        }
        if self.fail_on.as_deref().is_some_and(|p| line.contains(p)) {
            return Err(TransportError::Device(format!("Error: rejected {}", line)));
        }
        Ok(Vec::new())
    }

    fn name(&self) -> &str {
        "recording"
    }
}

// ---------------------------------------------------------------------------
// Live runtime
// ---------------------------------------------------------------------------

/// Config with motion-complete waits off, so only the commands themselves
/// reach the transport.
pub fn quiet_config() -> PrintloopConfig {
    PrintloopConfig {
        queue: QueueConfig {
            wait_for_motion: false,
            ..QueueConfig::default()
        },
        ..PrintloopConfig::default()
    }
}

pub async fn live_with(transport: Arc<RecordingTransport>) -> Live {
    Live::start(&quiet_config(), transport, Session::ephemeral()).await
}
