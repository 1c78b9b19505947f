//! Error types for scheduler operations.

use thiserror::Error;

/// Errors produced by scheduler components.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A task submission was rejected before it reached the queue.
    #[error("invalid submission: {0}")]
    InvalidSubmission(String),
    /// No handler is registered under the task's function name.
    #[error("unknown handler function: {0}")]
    UnknownHandler(String),
    /// The queue backend refused or could not store the task.
    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),
    /// A task envelope carried a version this build does not understand.
    #[error("unsupported task envelope version: {0}")]
    EnvelopeVersion(u8),
    /// `start` was called while the manager is already running.
    #[error("task manager is already running")]
    AlreadyRunning,
    /// `stop` was called while the manager is not running.
    #[error("task manager is not running")]
    NotRunning,
    /// Redis backend failure.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    /// SQLite persistence failure.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    /// Task envelope or result (de)serialization failure.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
