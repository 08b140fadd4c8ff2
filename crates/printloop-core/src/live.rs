//! The live-coding runtime.
//!
//! [`Live`] owns one printer, one motion queue, one scheduler and the session
//! they report to. Code reaches the printer through an [`Executor`], which
//! carries the [`Source`] its commands are attributed to: the main flow gets
//! [`Source::Main`], each task gets its own.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use printloop_core::config::PrintloopConfig;
//! use printloop_core::live::Live;
//! use printloop_core::session::Session;
//! use printloop_core::transport::DryRunTransport;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let live = Live::start(
//!         &PrintloopConfig::default(),
//!         Arc::new(DryRunTransport::new()),
//!         Session::ephemeral(),
//!     )
//!     .await;
//!
//!     live.run_source("# moveto x: 20 y: 20 speed: 80 | turn 45").await;
//!     live.add_shorthand_task("zbump", Duration::from_millis(4000), "# up 1")
//!         .await?;
//!
//!     tokio::time::sleep(Duration::from_secs(12)).await;
//!     live.shutdown().await;
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::ast::{Statement, ROOT_RECEIVER};
use crate::compiler::{compile_block, compile_line, compile_source, SourceItem};
use crate::config::PrintloopConfig;
use crate::error::{LiveError, ParseError};
use crate::motion::Source;
use crate::printer::{Printer, StepOutcome};
use crate::queue::{DrainHandle, MotionQueue};
use crate::scheduler::{callback, Scheduler, SchedulerHandle, TaskFuture, TaskInfo, Tick};
use crate::session::{Session, SessionEvent};
use crate::transport::Transport;
use crate::value::Value;

type Vars = Arc<RwLock<HashMap<String, Value>>>;

/// What happened while running a script.
#[derive(Debug, Default)]
pub struct RunReport {
    /// Statements that ran to completion.
    pub executed: usize,
    pub parse_errors: Vec<ParseError>,
    /// Statements that failed at run time, with their source line.
    pub failures: Vec<(usize, LiveError)>,
    /// Lines left untouched by the shorthand compiler.
    pub passthrough: usize,
}

impl RunReport {
    pub fn is_clean(&self) -> bool {
        self.parse_errors.is_empty() && self.failures.is_empty()
    }

    /// Exit code for the command-line host: 0 when clean, otherwise the code
    /// of the first problem found.
    pub fn exit_code(&self) -> i32 {
        if !self.parse_errors.is_empty() {
            return 2;
        }
        self.failures.first().map_or(0, |(_, e)| e.exit_code())
    }
}

/// Runs compiled statements against the printer on behalf of one source.
#[derive(Clone)]
pub struct Executor {
    printer: Printer,
    vars: Vars,
    source: Source,
}

impl Executor {
    pub fn source(&self) -> &Source {
        &self.source
    }

    /// Execute one statement, step by step.
    ///
    /// Returns the terminal value if the last step produced one.
    pub async fn execute(&self, stmt: &Statement) -> Result<Option<Value>, LiveError> {
        let root = stmt.root();
        if root != ROOT_RECEIVER {
            return Err(LiveError::UnknownReceiver {
                receiver: root.to_string(),
                method: stmt.steps.first().map(|s| s.method.clone()).unwrap_or_default(),
                line: stmt.line,
            });
        }

        let span = info_span!("statement", line = stmt.line, source = %self.source);
        async {
            let vars = self.vars.read().await.clone();
            let mut last: Option<Value> = None;
            for step in &stmt.steps {
                if let Some(value) = &last {
                    return Err(LiveError::UnknownReceiver {
                        receiver: value.to_string(),
                        method: step.method.clone(),
                        line: step.line,
                    });
                }
                match self
                    .printer
                    .call(&step.method, &step.args, &vars, &self.source, step.line)
                    .await?
                {
                    StepOutcome::Chain => {}
                    StepOutcome::Value(value) => last = Some(value),
                }
            }
            debug!(steps = stmt.steps.len(), "statement done");
            Ok(last)
        }
        .instrument(span)
        .await
    }

    /// Compile and execute a single shorthand line.
    pub async fn run_line(&self, line: &str) -> Result<Option<Value>, LiveError> {
        let stmt = compile_line(line, 1)?;
        self.execute(&stmt).await
    }

    pub async fn set_var(&self, name: impl Into<String>, value: impl Into<Value>) {
        self.vars.write().await.insert(name.into(), value.into());
    }

    pub async fn var(&self, name: &str) -> Option<Value> {
        self.vars.read().await.get(name).cloned()
    }
}

pub struct Live {
    printer: Printer,
    scheduler: Scheduler,
    session: Arc<Session>,
    vars: Vars,
    drain: DrainHandle,
    scheduler_handle: SchedulerHandle,
}

impl Live {
    /// Start the drain loop and the scheduler loop.
    pub async fn start(
        config: &PrintloopConfig,
        transport: Arc<dyn Transport>,
        session: Arc<Session>,
    ) -> Self {
        info!(transport = transport.name(), session_id = %session.id, "starting live session");
        let (queue, drain) = MotionQueue::spawn(&config.queue, transport, session.clone());
        let (scheduler, scheduler_handle) = Scheduler::spawn(&config.scheduler, session.clone());
        let printer = Printer::new(config.printer.clone(), queue, config.queue.await_completion);
        session
            .record(SessionEvent::Started {
                session_id: session.id,
            })
            .await;

        Self {
            printer,
            scheduler,
            session,
            vars: Arc::new(RwLock::new(HashMap::new())),
            drain,
            scheduler_handle,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn printer(&self) -> &Printer {
        &self.printer
    }

    pub fn queue(&self) -> &MotionQueue {
        self.printer.queue()
    }

    pub fn executor(&self, source: Source) -> Executor {
        Executor {
            printer: self.printer.clone(),
            vars: self.vars.clone(),
            source,
        }
    }

    /// Execute one statement from the main flow.
    pub async fn execute(&self, stmt: &Statement) -> Result<Option<Value>, LiveError> {
        self.executor(Source::Main).execute(stmt).await
    }

    /// Compile and run a whole script from the main flow.
    ///
    /// Bad lines are reported and skipped; a failing statement does not stop
    /// the ones after it.
    pub async fn run_source(&self, source: &str) -> RunReport {
        let executor = self.executor(Source::Main);
        let mut report = RunReport::default();

        for item in compile_source(source) {
            match item {
                SourceItem::Statement(stmt) => match executor.execute(&stmt).await {
                    Ok(_) => report.executed += 1,
                    Err(e) => {
                        warn!(line = stmt.line, error = %e, "statement failed");
                        report.failures.push((stmt.line, e));
                    }
                },
                SourceItem::Error(err) => {
                    self.record_parse_error(&err).await;
                    report.parse_errors.push(err);
                }
                SourceItem::Passthrough { line, text } => {
                    debug!(line, %text, "passthrough line");
                    report.passthrough += 1;
                }
            }
        }
        report
    }

    /// Register (or replace) a task whose body is arbitrary async code.
    ///
    /// The body gets an [`Executor`] attributed to the task and the [`Tick`]
    /// being served.
    pub fn add_task<F, Fut>(&self, name: &str, interval: Duration, body: F) -> Result<(), LiveError>
    where
        F: Fn(Executor, Tick) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), LiveError>> + Send + 'static,
    {
        let executor = self.executor(Source::Task(name.to_string()));
        self.scheduler
            .add_task(name, interval, callback(move |tick| body(executor.clone(), tick)))
    }

    /// Run `body` once, `delay` from now.
    pub fn schedule_once<F, Fut>(&self, name: &str, delay: Duration, body: F) -> Result<(), LiveError>
    where
        F: Fn(Executor, Tick) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), LiveError>> + Send + 'static,
    {
        let executor = self.executor(Source::Task(name.to_string()));
        self.scheduler
            .schedule_once(name, delay, callback(move |tick| body(executor.clone(), tick)))
    }

    /// Register (or replace) a task whose body is shorthand.
    ///
    /// The body is compiled once, here. If any line fails to compile nothing
    /// is registered and the first error is returned.
    pub async fn add_shorthand_task(
        &self,
        name: &str,
        interval: Duration,
        body: &str,
    ) -> Result<(), LiveError> {
        let statements = self.compile_task_body(body).await?;
        self.add_task(name, interval, shorthand_body(statements))
    }

    /// Shorthand counterpart of [`schedule_once`](Self::schedule_once).
    pub async fn schedule_shorthand_once(
        &self,
        name: &str,
        delay: Duration,
        body: &str,
    ) -> Result<(), LiveError> {
        let statements = self.compile_task_body(body).await?;
        self.schedule_once(name, delay, shorthand_body(statements))
    }

    async fn compile_task_body(&self, body: &str) -> Result<Arc<Vec<Statement>>, LiveError> {
        let compiled = compile_block(body, 1);
        for err in &compiled.errors {
            self.record_parse_error(err).await;
        }
        match compiled.errors.into_iter().next() {
            Some(err) => Err(err.into()),
            None => Ok(Arc::new(compiled.statements)),
        }
    }

    pub fn remove_task(&self, name: &str) -> Result<(), LiveError> {
        self.scheduler.remove_task(name)
    }

    pub fn clear_tasks(&self) -> Result<(), LiveError> {
        self.scheduler.clear()
    }

    pub async fn tasks(&self) -> Result<Vec<TaskInfo>, LiveError> {
        self.scheduler.tasks().await
    }

    pub async fn set_var(&self, name: impl Into<String>, value: impl Into<Value>) {
        self.vars.write().await.insert(name.into(), value.into());
    }

    pub async fn var(&self, name: &str) -> Option<Value> {
        self.vars.read().await.get(name).cloned()
    }

    /// Wait until every command queued so far has completed.
    pub async fn flush(&self) -> Result<(), LiveError> {
        self.printer.queue().flush().await
    }

    /// Stop the scheduler, let queued commands finish, then stop the queue.
    pub async fn shutdown(self) {
        self.scheduler_handle.shutdown().await;
        if let Err(e) = self.printer.queue().flush().await {
            warn!(error = %e, "queue did not drain cleanly");
        }
        self.drain.shutdown().await;
        self.session.record(SessionEvent::Ended).await;
        info!("live session ended");
    }

    async fn record_parse_error(&self, err: &ParseError) {
        warn!(line = err.line, column = err.column, message = %err.message, "parse error");
        self.session
            .record(SessionEvent::ParseFailed {
                line: err.line,
                column: err.column,
                message: err.message.clone(),
            })
            .await;
    }
}

/// Task body running precompiled shorthand. A closed queue ends the task.
fn shorthand_body(
    statements: Arc<Vec<Statement>>,
) -> impl Fn(Executor, Tick) -> TaskFuture + Send + Sync + 'static {
    move |executor: Executor, _tick: Tick| -> TaskFuture {
        let statements = statements.clone();
        Box::pin(async move {
            for stmt in statements.iter() {
                executor.execute(stmt).await.map_err(|e| match e {
                    LiveError::QueueClosed => LiveError::TaskFatal("motion queue is closed".to_string()),
                    other => other,
                })?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::transport::DryRunTransport;

    async fn live() -> (Live, Arc<DryRunTransport>) {
        let transport = Arc::new(DryRunTransport::new());
        let config = PrintloopConfig {
            queue: QueueConfig {
                wait_for_motion: false,
                ..QueueConfig::default()
            },
            ..PrintloopConfig::default()
        };
        let live = Live::start(&config, transport.clone(), Session::ephemeral()).await;
        (live, transport)
    }

    #[tokio::test]
    async fn run_source_reports_every_item() {
        let (live, transport) = live().await;
        let script = "\
// warm up
# moveto x: 20 y: 20 speed: 80
# moveto x: y: 20
lp.start(200)
# up 1 | get \"z\"
";
        let report = live.run_source(script).await;
        assert_eq!(report.executed, 2);
        assert_eq!(report.parse_errors.len(), 1);
        assert_eq!(report.parse_errors[0].line, 3);
        assert_eq!(report.passthrough, 2);
        assert_eq!(report.exit_code(), 2);
        assert_eq!(transport.sent(), vec!["G0 X20 Y20 Z0 F4800", "G0 X20 Y20 Z1 F4800"]);

        let events = live.session().events().await;
        assert!(events
            .iter()
            .any(|r| matches!(r.event, SessionEvent::ParseFailed { line: 3, .. })));
        live.shutdown().await;
    }

    #[tokio::test]
    async fn runtime_failure_does_not_stop_the_script() {
        let (live, transport) = live().await;
        let report = live.run_source("# up missing\n# up 2\n").await;
        assert_eq!(report.executed, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, 1);
        assert_eq!(report.exit_code(), 3);
        assert_eq!(transport.sent(), vec!["G0 X0 Y0 Z2 F3000"]);
        live.shutdown().await;
    }

    #[tokio::test]
    async fn foreign_root_and_calls_on_values_are_rejected() {
        let (live, _transport) = live().await;
        let main = live.executor(Source::Main);

        let err = main.run_line("# robot.moveto x: 1").await.unwrap_err();
        assert!(matches!(err, LiveError::UnknownReceiver { ref receiver, .. } if receiver == "robot"));

        let err = main.run_line("# get \"x\" | up 1").await.unwrap_err();
        assert!(matches!(err, LiveError::UnknownReceiver { ref method, .. } if method == "up"));

        let value = main.run_line("# lp.get \"maxz\"").await.unwrap();
        assert_eq!(value, Some(Value::Number(200.0)));
        live.shutdown().await;
    }

    #[tokio::test]
    async fn vars_resolve_at_execution_time() {
        let (live, _transport) = live().await;
        let stmt = compile_line("# upto level", 1).unwrap();

        live.set_var("level", 5.0).await;
        live.execute(&stmt).await.unwrap();
        live.set_var("level", 7.5).await;
        live.execute(&stmt).await.unwrap();

        assert_eq!(live.printer().snapshot().await.z, 7.5);
        live.shutdown().await;
    }

    #[tokio::test]
    async fn shorthand_task_with_bad_body_is_not_registered() {
        let (live, _transport) = live().await;
        let err = live
            .add_shorthand_task("broken", Duration::from_millis(100), "# up\n# moveto x:")
            .await
            .unwrap_err();
        assert!(matches!(err, LiveError::Parse(ref e) if e.line == 2));
        assert!(live.tasks().await.unwrap().is_empty());
        live.shutdown().await;
    }
}
