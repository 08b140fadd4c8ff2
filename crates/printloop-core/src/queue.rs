//! Ordered motion command queue.
//!
//! Every actuator primitive, whether called from the main flow or from a
//! scheduled task, ends up here. A single drain task forwards commands to the
//! [`Transport`] strictly in enqueue order and releases the next one only once
//! the device has acknowledged the current one (and, for physical moves,
//! finished it).
//!
//! # Example
//!
//! ```no_run
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//! use printloop_core::config::QueueConfig;
//! use printloop_core::motion::{MotionKind, Source};
//! use printloop_core::queue::MotionQueue;
//! use printloop_core::session::Session;
//! use printloop_core::transport::DryRunTransport;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (queue, drain) = MotionQueue::spawn(
//!         &QueueConfig::default(),
//!         Arc::new(DryRunTransport::new()),
//!         Session::ephemeral(),
//!     );
//!
//!     let ticket = queue.enqueue(MotionKind::Move, BTreeMap::new(), Source::Main).await?;
//!     let ack = ticket.completion().await?;
//!     println!("command #{} done in {} ms", ack.id, ack.elapsed_ms);
//!
//!     drain.shutdown().await;
//!     Ok(())
//! }
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

use crate::config::{Backpressure, QueueConfig};
use crate::error::LiveError;
use crate::motion::{Ack, MotionCommand, MotionKind, Source};
use crate::session::{Session, SessionEvent};
use crate::transport::{Transport, TransportError};
use crate::value::Value;

struct Entry {
    command: MotionCommand,
    done: oneshot::Sender<Result<Ack, LiveError>>,
}

/// Handle on a queued command.
#[derive(Debug)]
pub struct Ticket {
    pub id: u64,
    rx: oneshot::Receiver<Result<Ack, LiveError>>,
}

impl Ticket {
    /// Wait for the command to be acknowledged or fail.
    pub async fn completion(self) -> Result<Ack, LiveError> {
        self.rx.await.map_err(|_| LiveError::QueueClosed)?
    }
}

/// Producer side of the queue. Cheap to clone; every clone feeds the same
/// drain task.
#[derive(Clone)]
pub struct MotionQueue {
    tx: mpsc::Sender<Entry>,
    // Ids are assigned and entries sent under this lock, so id order is queue order.
    next_id: Arc<Mutex<u64>>,
    backpressure: Backpressure,
    session: Arc<Session>,
}

/// Consumer side, turned into a running task by [`Drain::spawn`].
pub struct Drain {
    rx: mpsc::Receiver<Entry>,
    ack_timeout: Duration,
    wait_for_motion: bool,
    session: Arc<Session>,
}

/// Handle for controlling a running drain task.
pub struct DrainHandle {
    cancel_token: CancellationToken,
    join_handle: JoinHandle<()>,
}

impl DrainHandle {
    /// Stop draining after the in-flight command and wait for the task to end.
    ///
    /// Commands still queued resolve with [`LiveError::QueueClosed`].
    pub async fn shutdown(self) {
        self.cancel_token.cancel();
        let _ = self.join_handle.await;
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.join_handle.is_finished()
    }
}

impl MotionQueue {
    /// Create the queue without starting the drain task.
    pub fn new(config: &QueueConfig, session: Arc<Session>) -> (Self, Drain) {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let queue = Self {
            tx,
            next_id: Arc::new(Mutex::new(1)),
            backpressure: config.backpressure,
            session: session.clone(),
        };
        let drain = Drain {
            rx,
            ack_timeout: config.ack_timeout(),
            wait_for_motion: config.wait_for_motion,
            session,
        };
        (queue, drain)
    }

    /// Create the queue and start draining into `transport`.
    pub fn spawn(
        config: &QueueConfig,
        transport: Arc<dyn Transport>,
        session: Arc<Session>,
    ) -> (Self, DrainHandle) {
        let (queue, drain) = Self::new(config, session);
        (queue, drain.spawn(transport))
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Commands waiting to be drained, not counting the one in flight.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a command.
    ///
    /// At capacity this suspends ([`Backpressure::Block`]) or fails with
    /// [`LiveError::QueueFull`] ([`Backpressure::FailFast`]).
    pub async fn enqueue(
        &self,
        kind: MotionKind,
        params: BTreeMap<String, Value>,
        source: Source,
    ) -> Result<Ticket, LiveError> {
        let permit = match self.backpressure {
            Backpressure::Block => self.tx.reserve().await.map_err(|_| LiveError::QueueClosed)?,
            Backpressure::FailFast => self.tx.try_reserve().map_err(|e| match e {
                mpsc::error::TrySendError::Full(()) => LiveError::QueueFull {
                    capacity: self.capacity(),
                },
                mpsc::error::TrySendError::Closed(()) => LiveError::QueueClosed,
            })?,
        };

        let (done, rx) = oneshot::channel();
        let id = {
            let mut next_id = self.next_id.lock().map_err(|_| LiveError::QueueClosed)?;
            let id = *next_id;
            *next_id += 1;
            permit.send(Entry {
                command: MotionCommand::new(id, kind, params, source.clone()),
                done,
            });
            id
        };

        debug!(id, %kind, %source, "command queued");
        self.session
            .record(SessionEvent::CommandQueued { id, kind, source })
            .await;
        Ok(Ticket { id, rx })
    }

    /// Wait until everything queued before this call has completed.
    pub async fn flush(&self) -> Result<(), LiveError> {
        let mut params = BTreeMap::new();
        params.insert("ms".to_string(), Value::Number(0.0));
        self.enqueue(MotionKind::Wait, params, Source::Main)
            .await?
            .completion()
            .await
            .map(|_| ())
    }
}

impl Drain {
    pub fn spawn(self, transport: Arc<dyn Transport>) -> DrainHandle {
        let cancel_token = CancellationToken::new();
        let token_clone = cancel_token.clone();

        let join_handle = tokio::spawn(async move {
            self.run_loop(transport, token_clone).await;
        });

        DrainHandle {
            cancel_token,
            join_handle,
        }
    }

    async fn run_loop(mut self, transport: Arc<dyn Transport>, cancel_token: CancellationToken) {
        loop {
            let entry = tokio::select! {
                biased;
                _ = cancel_token.cancelled() => break,
                entry = self.rx.recv() => match entry {
                    Some(entry) => entry,
                    None => break,
                },
            };

            let command = entry.command;
            let span = info_span!(
                "drain_command",
                id = command.id,
                kind = %command.kind,
                source = %command.submitted_by,
            );
            let result = self.process(&command, transport.as_ref()).instrument(span).await;

            match &result {
                Ok(ack) => {
                    self.session
                        .record(SessionEvent::CommandCompleted {
                            id: command.id,
                            gcode: command.to_gcode(),
                            elapsed_ms: ack.elapsed_ms,
                        })
                        .await;
                }
                Err(e) => {
                    warn!(id = command.id, error = %e, "command failed, queue advances");
                    self.session
                        .record(SessionEvent::CommandFailed {
                            id: command.id,
                            error: e.to_string(),
                        })
                        .await;
                }
            }
            // The enqueuer may have stopped waiting.
            let _ = entry.done.send(result);
        }
        debug!("drain loop stopped");
    }

    async fn process(&self, command: &MotionCommand, transport: &dyn Transport) -> Result<Ack, LiveError> {
        let start = Instant::now();
        let replies = match command.kind {
            MotionKind::Wait => {
                tokio::time::sleep(command.wait_duration()).await;
                Vec::new()
            }
            MotionKind::Turn => Vec::new(),
            MotionKind::Move | MotionKind::Extrude | MotionKind::RawGcode => {
                let gcode = command.to_gcode().ok_or_else(|| LiveError::InvalidArgument {
                    method: command.kind.to_string(),
                    message: "command has no G-code".to_string(),
                })?;
                let wait_for_motion = self.wait_for_motion && command.kind.is_physical();
                let round_trip = async {
                    let replies = transport.submit(&gcode).await?;
                    if wait_for_motion {
                        transport.wait_motion_complete().await?;
                    }
                    Ok::<Vec<String>, TransportError>(replies)
                };
                match timeout(self.ack_timeout, round_trip).await {
                    Ok(Ok(replies)) => replies,
                    Ok(Err(source)) => {
                        return Err(LiveError::TransportFailure {
                            id: command.id,
                            source,
                        })
                    }
                    Err(_) => {
                        transport.reset().await;
                        return Err(LiveError::TransportTimeout {
                            id: command.id,
                            timeout_ms: self.ack_timeout.as_millis() as u64,
                        })
                    }
                }
            }
        };
        let elapsed_ms = start.elapsed().as_millis() as u64;
        debug!(elapsed_ms, "command complete");
        Ok(Ack {
            id: command.id,
            replies,
            elapsed_ms,
        })
    }
}
