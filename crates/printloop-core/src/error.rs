//! Error types shared across the runtime.
//!
//! [`ParseError`] is produced by the shorthand compiler and always carries the
//! line and column of the offending text. [`LiveError`] covers everything that
//! can go wrong once a statement runs: dispatch, argument evaluation, queueing
//! and delivery to the transport.

use thiserror::Error;

use crate::transport::TransportError;

/// A malformed shorthand line.
///
/// Parse errors abort only the line they were found on; the rest of a block
/// and any running tasks are unaffected.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("parse error at line {line}, column {column}: {message}")]
pub struct ParseError {
    /// 1-based source line.
    pub line: usize,
    /// 1-based column within the line.
    pub column: usize,
    /// Human-readable description.
    pub message: String,
}

impl ParseError {
    pub(crate) fn new(line: usize, column: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            column,
            message: message.into(),
        }
    }
}

/// Errors raised while executing statements, running tasks or draining the
/// motion queue.
#[derive(Error, Debug)]
pub enum LiveError {
    /// A shorthand line could not be compiled.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// A compiled step names a method the receiver does not expose.
    #[error("line {line}: `{receiver}` has no method `{method}`")]
    UnknownReceiver {
        receiver: String,
        method: String,
        line: usize,
    },

    /// An argument had the wrong type, was missing, or could not be evaluated.
    #[error("invalid argument for `{method}`: {message}")]
    InvalidArgument { method: String, message: String },

    /// A bare identifier could not be resolved at execution time.
    #[error("unresolved identifier `{0}`")]
    UnresolvedIdentifier(String),

    /// The queue is at capacity and configured to fail fast.
    #[error("motion queue is full ({capacity} commands pending)")]
    QueueFull { capacity: usize },

    /// The drain loop has shut down.
    #[error("motion queue is closed")]
    QueueClosed,

    /// No acknowledgment arrived within the configured bound.
    #[error("no acknowledgment for command #{id} within {timeout_ms} ms")]
    TransportTimeout { id: u64, timeout_ms: u64 },

    /// The transport reported a failure for a command.
    #[error("transport failed on command #{id}: {source}")]
    TransportFailure {
        id: u64,
        #[source]
        source: TransportError,
    },

    /// The scheduler loop has shut down.
    #[error("scheduler is not running")]
    SchedulerStopped,

    /// A task callback hit an unrecoverable condition; the task is unregistered.
    #[error("fatal task error: {0}")]
    TaskFatal(String),

    /// An I/O error outside the transport (reading scripts, log files).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LiveError {
    /// Whether a task that returned this error should be unregistered.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LiveError::TaskFatal(_))
    }

    /// Process exit code used by the command-line host.
    pub fn exit_code(&self) -> i32 {
        match self {
            LiveError::Parse(_) => 2,
            LiveError::TransportTimeout { .. } | LiveError::TransportFailure { .. } => 1,
            LiveError::Io(_) => 4,
            _ => 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_display_includes_position() {
        let err = ParseError::new(3, 14, "missing value for argument `x`");
        assert_eq!(
            err.to_string(),
            "parse error at line 3, column 14: missing value for argument `x`"
        );
    }

    #[test]
    fn only_task_fatal_is_fatal() {
        assert!(LiveError::TaskFatal("boom".into()).is_fatal());
        assert!(!LiveError::QueueClosed.is_fatal());
        assert!(!LiveError::UnresolvedIdentifier("a".into()).is_fatal());
    }

    #[test]
    fn exit_codes() {
        assert_eq!(LiveError::Parse(ParseError::new(1, 1, "x")).exit_code(), 2);
        assert_eq!(LiveError::TransportTimeout { id: 1, timeout_ms: 5 }.exit_code(), 1);
        assert_eq!(LiveError::QueueFull { capacity: 4 }.exit_code(), 3);
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(LiveError::Io(io).exit_code(), 4);
    }
}
