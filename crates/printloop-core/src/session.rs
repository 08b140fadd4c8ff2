//! Session event bus and persistent event log.
//!
//! A [`Session`] collects everything observable about a performance: commands
//! entering and leaving the motion queue, tasks being added, replaced, fired
//! and failing, and shorthand lines that failed to compile.
//!
//! - Events are broadcast to subscribers as they happen
//! - The most recent events are kept in a ring buffer
//! - Events are persisted to JSON Lines files in `~/.printloop/logs/`
//!
//! # Example
//!
//! ```no_run
//! use printloop_core::session::{Session, SessionEvent};
//!
//! #[tokio::main]
//! async fn main() {
//!     let session = Session::new("rehearsal");
//!     let mut rx = session.subscribe();
//!
//!     session.record(SessionEvent::TaskRemoved { name: "zbump".into() }).await;
//!     let record = rx.recv().await.unwrap();
//!     println!("{} {:?}", record.timestamp, record.event);
//! }
//! ```

use std::collections::VecDeque;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, RwLock};
use uuid::Uuid;

use crate::config::printloop_dir;
use crate::motion::{MotionKind, Source};

/// Maximum number of events retained in memory.
const MAX_EVENT_LOG_SIZE: usize = 1000;

/// Returns the logs directory path (`~/.printloop/logs/`), creating it if needed.
pub fn logs_dir() -> PathBuf {
    let dir = printloop_dir().join("logs");
    std::fs::create_dir_all(&dir).ok();
    dir
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SessionEvent {
    Started { session_id: Uuid },
    Ended,

    CommandQueued { id: u64, kind: MotionKind, source: Source },
    CommandCompleted {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        gcode: Option<String>,
        elapsed_ms: u64,
    },
    CommandFailed { id: u64, error: String },

    TaskAdded { name: String, interval_ms: u64 },
    /// A running task's interval or callback was swapped in place.
    TaskReplaced { name: String, interval_ms: u64 },
    TaskRemoved { name: String },
    TaskFired { name: String, fire_count: u64 },
    /// A task callback returned an error. Fatal errors unregister the task.
    TaskFailed { name: String, error: String, fatal: bool },

    ParseFailed { line: usize, column: usize, message: String },
}

/// A timestamped session event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event: SessionEvent,
}

pub struct Session {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    events: RwLock<VecDeque<EventRecord>>,
    event_tx: broadcast::Sender<EventRecord>,
    log_writer: Mutex<Option<BufWriter<std::fs::File>>>,
    log_path: Option<PathBuf>,
}

impl Session {
    /// Create a session logging to `~/.printloop/logs/{name}_{timestamp}.jsonl`.
    pub fn new(session_name: &str) -> Arc<Self> {
        Self::new_with_log_dir(session_name, &logs_dir())
    }

    /// Create a session logging into `dir`.
    ///
    /// If the file cannot be created the session still works, without
    /// persistence.
    pub fn new_with_log_dir(session_name: &str, dir: &Path) -> Arc<Self> {
        let created_at = Utc::now();
        let timestamp = created_at.format("%Y%m%d_%H%M%S");
        let path = dir.join(format!("{}_{}.jsonl", session_name, timestamp));
        match std::fs::File::create(&path) {
            Ok(file) => Self::build(created_at, Some(BufWriter::new(file)), Some(path)),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "session log disabled");
                Self::build(created_at, None, None)
            }
        }
    }

    /// Create a session with no log file.
    pub fn ephemeral() -> Arc<Self> {
        Self::build(Utc::now(), None, None)
    }

    fn build(
        created_at: DateTime<Utc>,
        log_writer: Option<BufWriter<std::fs::File>>,
        log_path: Option<PathBuf>,
    ) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            id: Uuid::new_v4(),
            created_at,
            events: RwLock::new(VecDeque::with_capacity(MAX_EVENT_LOG_SIZE)),
            event_tx,
            log_writer: Mutex::new(log_writer),
            log_path,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.event_tx.subscribe()
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    /// Record an event: ring buffer, log file, then broadcast.
    pub async fn record(&self, event: SessionEvent) -> EventRecord {
        let record = EventRecord {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event,
        };

        {
            let mut events = self.events.write().await;
            if events.len() >= MAX_EVENT_LOG_SIZE {
                events.pop_front();
            }
            events.push_back(record.clone());
        }

        {
            let mut writer_guard = self.log_writer.lock().await;
            if let Some(ref mut writer) = *writer_guard {
                if let Ok(json) = serde_json::to_string(&record) {
                    let _ = writeln!(writer, "{}", json);
                    let _ = writer.flush();
                }
            }
        }

        // No subscribers is fine.
        let _ = self.event_tx.send(record.clone());
        record
    }

    /// All retained events in chronological order.
    pub async fn events(&self) -> Vec<EventRecord> {
        self.events.read().await.iter().cloned().collect()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("log_path", &self.log_path)
            .finish_non_exhaustive()
    }
}
