//! Error types for prefork.

use std::time::Duration;

use thiserror::Error;

/// Main error type for prefork.
#[derive(Error, Debug)]
pub enum Error {
    /// A bounded wait elapsed with no progress (heartbeat, startup, shutdown).
    #[error("timed out after {timeout:?} waiting for {what}")]
    Timeout {
        /// What the wait was for (e.g. "heartbeat", "daemon startup").
        what: String,
        /// The configured bound that elapsed.
        timeout: Duration,
    },

    /// The child received a frame it has no handler for.
    #[error("unknown signal over the pipe: {0}")]
    UnknownSignal(String),

    /// The parent received a frame outside the heartbeat protocol.
    #[error("unknown response over the pipe: {0}")]
    UnknownResponse(String),

    /// The child marshalled an error frame; kind and message survive the trip.
    #[error("child raised ({kind}): {message}")]
    ChildRaised { kind: String, message: String },

    /// An alive PID is already recorded for this program.
    #[error("already started: pid {pid} is alive")]
    AlreadyStarted { pid: i32 },

    /// Invalid construction or argument.
    #[error("{0}")]
    Argument(String),

    /// A required capability was not supplied.
    #[error("`{0}` must be implemented")]
    NotImplemented(&'static str),

    /// A bounded wait was interrupted by a signal before completing.
    #[error("interrupted by signal")]
    Interrupted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("system call failed: {0}")]
    Sys(#[from] nix::Error),
}

impl Error {
    /// Short stable label (snake_case) for logs and wire transport.
    pub fn label(&self) -> &'static str {
        match self {
            Error::Timeout { .. } => "timeout",
            Error::UnknownSignal(_) => "unknown_signal",
            Error::UnknownResponse(_) => "unknown_response",
            Error::ChildRaised { .. } => "child_raised",
            Error::AlreadyStarted { .. } => "already_started",
            Error::Argument(_) => "argument",
            Error::NotImplemented(_) => "not_implemented",
            Error::Interrupted => "interrupted",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Sys(_) => "sys",
        }
    }

    /// True for the timeout kind, regardless of what the wait was for.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}

/// Result type alias for prefork operations.
pub type Result<T> = std::result::Result<T, Error>;
