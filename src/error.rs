//! Error types for the live query engine.

use crate::types::Position;
use thiserror::Error;

/// Main error type for live query operations.
#[derive(Debug, Error)]
pub enum LiveQueryError {
    #[error("Invalid selector: {0}")]
    InvalidSelector(String),

    #[error("Invalid modifier: {0}")]
    InvalidModifier(String),

    /// A `$set` tried to traverse through a scalar or null.
    #[error("Cannot use the part '{part}' of '{path}' to traverse the element")]
    ModifierConflict { path: String, part: String },

    #[error("Malformed oplog entry: {0}")]
    MalformedEntry(String),

    #[error("Non-monotonic oplog position: {got} after {last}")]
    NonMonotonicPosition { last: Position, got: Position },

    #[error("Unexpected namespace: {0}")]
    UnexpectedNamespace(String),

    #[error("Replication log error: {0}")]
    Log(String),

    #[error("Oplog tailer is stopped")]
    TailerStopped,

    #[error("Oplog tailer failed: {0}")]
    TailerFailed(String),

    #[error("Can't observe a query from inside an observe callback on the same query")]
    Reentrant,

    #[error("Observe multiplexer is stopped")]
    MultiplexerStopped,

    #[error("Can't make an observe multiplexer ready twice")]
    AlreadyReady,

    #[error("Callback '{callback}' is not valid for an {ordering} query")]
    UnsupportedCallback {
        callback: &'static str,
        ordering: &'static str,
    },

    #[error("Result cache inconsistency: {0}")]
    Cache(String),

    #[error("Task panicked: {0}")]
    TaskPanicked(String),

    #[error("Task queue is closed")]
    QueueClosed,

    #[error("Write fence has already fired")]
    FenceFired,

    #[error("Write fence is already armed")]
    FenceArmed,

    #[error("Can't retire a write fence that hasn't fired")]
    FenceNotFired,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl LiveQueryError {
    /// Whether this error leaves the tailer unable to continue.
    pub fn is_fatal_to_tailer(&self) -> bool {
        matches!(
            self,
            LiveQueryError::MalformedEntry(_)
                | LiveQueryError::NonMonotonicPosition { .. }
                | LiveQueryError::UnexpectedNamespace(_)
                | LiveQueryError::Log(_)
        )
    }
}

impl From<serde_json::Error> for LiveQueryError {
    fn from(e: serde_json::Error) -> Self {
        LiveQueryError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for LiveQueryError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        LiveQueryError::Serialization(e.to_string())
    }
}

/// Only log entries are decoded from MessagePack.
impl From<rmp_serde::decode::Error> for LiveQueryError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        LiveQueryError::MalformedEntry(e.to_string())
    }
}

/// Result type for live query operations.
pub type Result<T> = std::result::Result<T, LiveQueryError>;
