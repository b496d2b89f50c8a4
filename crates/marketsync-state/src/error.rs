//! State backend error types.

use marketsync_types::state::{PipelineId, RunStatus};

/// Errors produced by the storage contracts in [`crate::backend`].
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Underlying `SQLite` failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// `SQLite` failure with the operation that produced it.
    #[error("{context}: {source}")]
    SqliteContext {
        context: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    /// File-system I/O failure (e.g. creating the database directory).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal mutex was poisoned by a panicked thread.
    #[error("state backend lock poisoned")]
    LockPoisoned,

    /// Another run of the pipeline holds the `running` slot.
    #[error("pipeline '{pipeline}' already has run {run_id} in progress")]
    AlreadyRunning { pipeline: PipelineId, run_id: i64 },

    #[error("run {0} not found")]
    RunNotFound(i64),

    /// Requested status change is not allowed from the stored status.
    #[error("run {run_id} cannot move from {from} to {to}")]
    InvalidTransition {
        run_id: i64,
        from: RunStatus,
        to: RunStatus,
    },

    /// Error payload could not be (de)serialized.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),

    /// A stored value could not be decoded.
    #[error("corrupt state value in {column}: {value}")]
    Corrupt { column: &'static str, value: String },
}

impl StateError {
    pub(crate) fn context(context: &'static str) -> impl FnOnce(rusqlite::Error) -> Self {
        move |source| Self::SqliteContext { context, source }
    }

    pub(crate) fn corrupt(column: &'static str, value: impl Into<String>) -> Self {
        Self::Corrupt {
            column,
            value: value.into(),
        }
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StateError>;
