//! Error types for the scheduling engine

use thiserror::Error;

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Comprehensive error types for the cycling scheduler
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// Graph / config validation error, surfaced at startup
    #[error("Input error: {0}")]
    Input(String),

    /// Atom references a task name with no matching TaskDefinition
    #[error("Unknown task: {0}")]
    UnknownTask(String),

    /// Atom references an output the named task never declares
    #[error("Task {task} has no output named {output}")]
    UnknownOutput { task: String, output: String },

    /// A sequence's declared range is empty after exclusions
    #[error("Sequence {0} is empty after applying exclusions")]
    EmptySequence(String),

    /// Comparison or arithmetic across incompatible calendars
    #[error("Cannot compare cycle points from different calendars: {0} vs {1}")]
    CalendarMismatch(String, String),

    /// Invalid TaskProxy state transition
    #[error("Invalid state transition from {from:?} to {to:?}")]
    InvalidStateTransition { from: String, to: String },

    /// Proxy already exists for (name, cycle, flow_tag)
    #[error("Proxy already exists: {0}")]
    DuplicateProxy(String),

    /// Proxy not found for a command/query
    #[error("No such task proxy: {0}")]
    ProxyNotFound(String),

    /// Job runner submit failed (after retries exhausted)
    #[error("Job submission failed: {0}")]
    RunnerSubmit(String),

    /// Job runner poll failed
    #[error("Job poll failed: {0}")]
    RunnerPoll(String),

    /// Job runner kill failed
    #[error("Job kill failed: {0}")]
    RunnerKill(String),

    /// Inbound message rejected (stale/future submit_num, unknown proxy)
    #[error("Message rejected: {0}")]
    MessageRejected(String),

    /// Xtrigger function raised or timed out
    #[error("Xtrigger {0} error: {1}")]
    Xtrigger(String, String),

    /// Persisted-state read/write error
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Programmer error / broken invariant — not locally recoverable
    #[error("Invariant violated: {0}")]
    Invariant(String),

    /// Operator command was malformed or refers to nothing
    #[error("Command error: {0}")]
    Command(String),
}

impl From<std::io::Error> for SchedulerError {
    fn from(err: std::io::Error) -> Self {
        SchedulerError::Persistence(err.to_string())
    }
}

impl From<sled::Error> for SchedulerError {
    fn from(err: sled::Error) -> Self {
        SchedulerError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Persistence(format!("serialization error: {err}"))
    }
}
