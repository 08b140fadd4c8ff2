//! Named, hot-swappable tasks: periodic ones and one-shot events.
//!
//! One control loop owns the task registry. [`Scheduler`] handles talk to it
//! over a channel, so registering, replacing and removing tasks never races
//! with firing them.
//!
//! Each iteration the loop fires every task whose next fire time has passed
//! and that is not still running. On completion the task's last fire time is
//! set to the time it was *scheduled* for, not the time it actually ran, so
//! intervals do not drift. Ticks that fell due while an invocation was still
//! running are skipped, never queued up. A one-shot task is unregistered once
//! its single invocation finishes.
//!
//! Callbacks receive a [`Tick`] carrying the scheduled fire time, so a
//! pattern can lock its phase to the schedule rather than to the wall clock.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use printloop_core::config::SchedulerConfig;
//! use printloop_core::scheduler::{callback, Scheduler};
//! use printloop_core::session::Session;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (scheduler, handle) = Scheduler::spawn(&SchedulerConfig::default(), Session::ephemeral());
//!
//!     scheduler.add_task("tick", Duration::from_millis(500), callback(|tick| async move {
//!         println!("tick #{}", tick.fire_count);
//!         Ok(())
//!     }))?;
//!
//!     tokio::time::sleep(Duration::from_secs(2)).await;
//!     scheduler.remove_task("tick")?;
//!     handle.shutdown().await;
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::SchedulerConfig;
use crate::error::LiveError;
use crate::session::{Session, SessionEvent};

pub type TaskFuture = Pin<Box<dyn Future<Output = Result<(), LiveError>> + Send>>;

/// A task body. Called once per tick; the returned future may suspend.
pub type TaskCallback = Arc<dyn Fn(Tick) -> TaskFuture + Send + Sync>;

/// Wrap an async closure as a [`TaskCallback`].
pub fn callback<F, Fut>(f: F) -> TaskCallback
where
    F: Fn(Tick) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), LiveError>> + Send + 'static,
{
    Arc::new(move |tick| Box::pin(f(tick)))
}

/// One firing of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    /// When the invocation was due. Never later than when it actually started.
    pub scheduled_at: Instant,
    /// 1 for the first invocation.
    pub fire_count: u64,
}

/// Snapshot of a registered task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskInfo {
    pub name: String,
    /// Period of a repeating task, delay of a one-shot task.
    pub interval_ms: u64,
    pub repeat: bool,
    pub running: bool,
    pub fire_count: u64,
}

enum Control {
    Add {
        name: String,
        interval: Duration,
        repeat: bool,
        callback: TaskCallback,
    },
    Remove {
        name: String,
    },
    Clear,
    List {
        reply: oneshot::Sender<Vec<TaskInfo>>,
    },
}

enum Outcome {
    Completed,
    Failed(LiveError),
    Panicked(String),
}

struct Finished {
    name: String,
    generation: u64,
    scheduled_at: Instant,
    outcome: Outcome,
}

struct Task {
    interval: Duration,
    repeat: bool,
    callback: TaskCallback,
    last_fired_at: Option<Instant>,
    next_due: Instant,
    running: bool,
    /// Bumped each time the task is replaced.
    generation: u64,
    /// Removed while an invocation was in flight; dropped once it finishes.
    removed: bool,
    fire_count: u64,
}

/// Handle for registering and removing tasks. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    control_tx: mpsc::UnboundedSender<Control>,
}

/// Handle for controlling the running scheduler loop.
pub struct SchedulerHandle {
    cancel_token: CancellationToken,
    join_handle: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop firing tasks and wait for the loop to end.
    ///
    /// Invocations already in flight run to completion first.
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

impl Scheduler {
    pub fn spawn(config: &SchedulerConfig, session: Arc<Session>) -> (Self, SchedulerHandle) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        let cancel_token = CancellationToken::new();
        let token_clone = cancel_token.clone();

        let event_loop = SchedulerLoop {
            tasks: HashMap::new(),
            control_rx,
            control_open: true,
            finished_tx,
            finished_rx,
            idle_poll: Duration::from_millis(config.idle_poll_ms.max(1)),
            session,
        };
        let join_handle = tokio::spawn(async move {
            event_loop.run(token_clone).await;
        });

        (
            Self { control_tx },
            SchedulerHandle {
                cancel_token,
                join_handle,
            },
        )
    }

    /// Register a task, or atomically replace the interval and callback of an
    /// existing one with the same name.
    ///
    /// A new task is due immediately. A replaced task keeps its schedule: an
    /// in-flight invocation finishes and the new definition applies from the
    /// next tick.
    pub fn add_task(
        &self,
        name: impl Into<String>,
        interval: Duration,
        callback: TaskCallback,
    ) -> Result<(), LiveError> {
        self.send(Control::Add {
            name: name.into(),
            interval,
            repeat: true,
            callback,
        })
    }

    /// Register a task that fires once, `delay` from now, and is then
    /// unregistered.
    ///
    /// Replacing an existing task of the same name reschedules it for `delay`
    /// from now.
    pub fn schedule_once(
        &self,
        name: impl Into<String>,
        delay: Duration,
        callback: TaskCallback,
    ) -> Result<(), LiveError> {
        self.send(Control::Add {
            name: name.into(),
            interval: delay,
            repeat: false,
            callback,
        })
    }

    /// Deregister a task. Unknown names are ignored.
    ///
    /// An invocation already running is not interrupted.
    pub fn remove_task(&self, name: impl Into<String>) -> Result<(), LiveError> {
        self.send(Control::Remove { name: name.into() })
    }

    /// Remove every task.
    pub fn clear(&self) -> Result<(), LiveError> {
        self.send(Control::Clear)
    }

    /// Registered tasks, sorted by name.
    pub async fn tasks(&self) -> Result<Vec<TaskInfo>, LiveError> {
        let (reply, rx) = oneshot::channel();
        self.send(Control::List { reply })?;
        rx.await.map_err(|_| LiveError::SchedulerStopped)
    }

    fn send(&self, msg: Control) -> Result<(), LiveError> {
        self.control_tx.send(msg).map_err(|_| LiveError::SchedulerStopped)
    }
}

struct SchedulerLoop {
    tasks: HashMap<String, Task>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    control_open: bool,
    finished_tx: mpsc::UnboundedSender<Finished>,
    finished_rx: mpsc::UnboundedReceiver<Finished>,
    idle_poll: Duration,
    session: Arc<Session>,
}

impl SchedulerLoop {
    async fn run(mut self, cancel_token: CancellationToken) {
        info!("scheduler started");
        loop {
            self.fire_due().await;
            let wake = self.next_wake();

            tokio::select! {
                biased;
                _ = cancel_token.cancelled() => break,
                Some(finished) = self.finished_rx.recv() => self.complete(finished).await,
                msg = self.control_rx.recv(), if self.control_open => match msg {
                    Some(msg) => self.handle(msg).await,
                    None => self.control_open = false,
                },
                _ = tokio::time::sleep_until(wake) => {}
            }
        }

        // Let in-flight invocations finish; nothing new fires.
        while self.tasks.values().any(|t| t.running) {
            match self.finished_rx.recv().await {
                Some(finished) => self.complete(finished).await,
                None => break,
            }
        }
        info!("scheduler stopped");
    }

    fn next_wake(&self) -> Instant {
        self.tasks
            .values()
            .filter(|t| !t.running && !t.removed)
            .map(|t| t.next_due)
            .min()
            .unwrap_or_else(|| Instant::now() + self.idle_poll)
    }

    async fn fire_due(&mut self) {
        let now = Instant::now();
        let mut fired = Vec::new();
        for (name, task) in self.tasks.iter_mut() {
            if task.running || task.removed || task.next_due > now {
                continue;
            }
            task.running = true;
            task.fire_count += 1;
            let tick = Tick {
                scheduled_at: task.next_due,
                fire_count: task.fire_count,
            };
            spawn_invocation(
                &self.finished_tx,
                name.clone(),
                task.generation,
                tick,
                task.callback.clone(),
            );
            fired.push((name.clone(), task.fire_count));
        }
        for (name, fire_count) in fired {
            debug!(task = %name, fire_count, "task fired");
            self.session
                .record(SessionEvent::TaskFired { name, fire_count })
                .await;
        }
    }

    async fn complete(&mut self, finished: Finished) {
        let Finished {
            name,
            generation,
            scheduled_at,
            outcome,
        } = finished;
        let Some(task) = self.tasks.get_mut(&name) else {
            return;
        };
        task.running = false;
        task.last_fired_at = Some(scheduled_at);
        // Replaced while this invocation ran: its failure says nothing about
        // the definition now registered.
        let current = generation == task.generation;

        let mut unregister = task.removed || (current && !task.repeat);
        match outcome {
            Outcome::Completed => {}
            Outcome::Failed(e) => {
                let fatal = current && e.is_fatal();
                warn!(task = %name, generation, current, error = %e, fatal, "task invocation failed");
                self.session
                    .record(SessionEvent::TaskFailed {
                        name: name.clone(),
                        error: e.to_string(),
                        fatal,
                    })
                    .await;
                unregister |= fatal;
            }
            Outcome::Panicked(message) => {
                error!(task = %name, generation, current, panic = %message, "task panicked");
                self.session
                    .record(SessionEvent::TaskFailed {
                        name: name.clone(),
                        error: message,
                        fatal: current,
                    })
                    .await;
                unregister |= current;
            }
        }

        if unregister {
            let was_removed = self.tasks.remove(&name).is_some_and(|t| t.removed);
            if !was_removed {
                info!(task = %name, "task unregistered");
                self.session.record(SessionEvent::TaskRemoved { name }).await;
            }
            return;
        }

        // Skip ticks that fell due while the invocation was running. A
        // one-shot replacement already carries its own fire time.
        let now = Instant::now();
        if let Some(task) = self.tasks.get_mut(&name) {
            if task.repeat {
                let mut next = scheduled_at + task.interval;
                while next < now {
                    next += task.interval;
                }
                task.next_due = next;
            }
        }
    }

    async fn handle(&mut self, msg: Control) {
        match msg {
            Control::Add {
                name,
                interval,
                repeat,
                callback,
            } => self.add(name, interval, repeat, callback).await,
            Control::Remove { name } => self.remove(&name).await,
            Control::Clear => {
                let names: Vec<String> = self
                    .tasks
                    .iter()
                    .filter(|(_, t)| !t.removed)
                    .map(|(n, _)| n.clone())
                    .collect();
                for name in names {
                    self.remove(&name).await;
                }
            }
            Control::List { reply } => {
                let mut infos: Vec<TaskInfo> = self
                    .tasks
                    .iter()
                    .filter(|(_, t)| !t.removed)
                    .map(|(name, t)| TaskInfo {
                        name: name.clone(),
                        interval_ms: t.interval.as_millis() as u64,
                        repeat: t.repeat,
                        running: t.running,
                        fire_count: t.fire_count,
                    })
                    .collect();
                infos.sort_by(|a, b| a.name.cmp(&b.name));
                let _ = reply.send(infos);
            }
        }
    }

    async fn add(&mut self, name: String, interval: Duration, repeat: bool, callback: TaskCallback) {
        let interval = if repeat {
            interval.max(Duration::from_millis(1))
        } else {
            interval
        };
        let interval_ms = interval.as_millis() as u64;
        let now = Instant::now();

        if let Some(task) = self.tasks.get_mut(&name) {
            task.interval = interval;
            task.repeat = repeat;
            task.callback = callback;
            task.generation += 1;
            task.removed = false;
            if !repeat {
                task.next_due = now + interval;
            } else if !task.running {
                task.next_due = match task.last_fired_at {
                    Some(last) => last + interval,
                    None => now,
                };
            }
            info!(task = %name, interval_ms, repeat, generation = task.generation, "task replaced");
            self.session
                .record(SessionEvent::TaskReplaced { name, interval_ms })
                .await;
            return;
        }

        let next_due = if repeat { now } else { now + interval };
        self.tasks.insert(
            name.clone(),
            Task {
                interval,
                repeat,
                callback,
                last_fired_at: None,
                next_due,
                running: false,
                generation: 0,
                removed: false,
                fire_count: 0,
            },
        );
        info!(task = %name, interval_ms, repeat, "task added");
        self.session
            .record(SessionEvent::TaskAdded { name, interval_ms })
            .await;
    }

    async fn remove(&mut self, name: &str) {
        let Some(task) = self.tasks.get_mut(name) else {
            debug!(task = name, "remove of unknown task ignored");
            return;
        };
        if task.removed {
            return;
        }
        if task.running {
            task.removed = true;
        } else {
            self.tasks.remove(name);
        }
        info!(task = name, "task removed");
        self.session
            .record(SessionEvent::TaskRemoved {
                name: name.to_string(),
            })
            .await;
    }
}

/// Run one invocation on its own task so a panic surfaces as a `JoinError`
/// instead of taking the loop down.
fn spawn_invocation(
    finished_tx: &mpsc::UnboundedSender<Finished>,
    name: String,
    generation: u64,
    tick: Tick,
    callback: TaskCallback,
) {
    let finished_tx = finished_tx.clone();
    let span = info_span!("task", name = %name, generation, fire_count = tick.fire_count);
    let scheduled_at = tick.scheduled_at;
    tokio::spawn(async move {
        let inner = tokio::spawn(async move { callback(tick).await }.instrument(span));
        let outcome = match inner.await {
            Ok(Ok(())) => Outcome::Completed,
            Ok(Err(e)) => Outcome::Failed(e),
            Err(e) => Outcome::Panicked(panic_message(e)),
        };
        let _ = finished_tx.send(Finished {
            name,
            generation,
            scheduled_at,
            outcome,
        });
    });
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}
