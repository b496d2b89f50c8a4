//! Run lifecycle model types.
//!
//! Pure data types used by `CheckpointStore` implementations and the
//! orchestrator. Kept in the types crate so the state and engine crates
//! share them without circular dependencies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorCategory;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Opaque pipeline identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineId(String);

impl PipelineId {
    /// Create a new pipeline identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PipelineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl<S: Into<String>> From<S> for PipelineId {
    fn from(value: S) -> Self {
        Self(value.into())
    }
}

/// Name of one upstream source (e.g. `"coingecko"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceName(String);

impl SourceName {
    /// Create a new source name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Borrow the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SourceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl<S: Into<String>> From<S> for SourceName {
    fn from(value: S) -> Self {
        Self(value.into())
    }
}

// ---------------------------------------------------------------------------
// Run tracking
// ---------------------------------------------------------------------------

/// Lifecycle status of a pipeline run.
///
/// `pending -> running -> {succeeded, failed, partial}`; the last three
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Partial,
}

impl RunStatus {
    /// Wire-format string for storage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Partial => "partial",
        }
    }

    /// Parse the storage representation produced by [`RunStatus::as_str`].
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "partial" => Some(Self::Partial),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Partial)
    }

    /// Derive the terminal status from per-source outcomes.
    ///
    /// Every source completed gives `succeeded`, every source failed gives
    /// `failed`, anything in between is `partial`. A run with no sources
    /// trivially succeeds.
    #[must_use]
    pub fn from_outcomes(completed: usize, failed: usize) -> Self {
        match (completed, failed) {
            (_, 0) => Self::Succeeded,
            (0, _) => Self::Failed,
            _ => Self::Partial,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of one source inside a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Pending,
    Completed,
    Failed,
}

impl SourceStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error attached to a run or to one of its sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub category: ErrorCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceName>,
    pub message: String,
}

impl RunError {
    #[must_use]
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            source: None,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn for_source(mut self, source: SourceName) -> Self {
        self.source = Some(source);
        self
    }
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.source {
            Some(source) => write!(f, "[{}] {}: {}", self.category, source, self.message),
            None => write!(f, "[{}] {}", self.category, self.message),
        }
    }
}

/// Incremental progress applied to one source of a running run.
///
/// Counters are deltas; the store adds them to the persisted totals in
/// the same transaction that replaces the cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub status: SourceStatus,
    /// Opaque resume token for the source (`None` keeps the stored one).
    pub cursor: Option<String>,
    pub delta_processed: u64,
    pub delta_failed: u64,
    pub delta_skipped: u64,
    pub error: Option<RunError>,
}

impl ProgressUpdate {
    /// A pending-progress update carrying only counter deltas and a cursor.
    #[must_use]
    pub fn batch(cursor: impl Into<String>, delta_processed: u64, delta_failed: u64) -> Self {
        Self {
            status: SourceStatus::Pending,
            cursor: Some(cursor.into()),
            delta_processed,
            delta_failed,
            delta_skipped: 0,
            error: None,
        }
    }
}

/// Persisted state of one source within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceCheckpoint {
    pub source: SourceName,
    pub status: SourceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    pub records_processed: u64,
    pub records_failed: u64,
    pub records_skipped: u64,
    /// Completed in an earlier run and carried into this one on resume.
    pub carried_over: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    pub updated_at: DateTime<Utc>,
}

/// Durable record of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: i64,
    pub pipeline: PipelineId,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub records_processed: u64,
    pub records_failed: u64,
    /// Per-source progress, ordered by source name.
    pub sources: Vec<SourceCheckpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<RunError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_from: Option<i64>,
    pub owner: String,
    pub heartbeat_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Look up the progress entry for `source`.
    #[must_use]
    pub fn source(&self, source: &SourceName) -> Option<&SourceCheckpoint> {
        self.sources.iter().find(|s| &s.source == source)
    }

    /// Sources this run has marked completed.
    pub fn completed_sources(&self) -> impl Iterator<Item = &SourceCheckpoint> {
        self.sources
            .iter()
            .filter(|s| s.status == SourceStatus::Completed)
    }
}

/// Parameters for opening a new run.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub pipeline: PipelineId,
    /// Every source the run will account for, carried or not.
    pub sources: Vec<SourceName>,
    /// Sources already completed by `resumed_from`, with their cursors.
    pub carried: Vec<(SourceName, Option<String>)>,
    pub resumed_from: Option<i64>,
    pub owner: String,
    /// A `running` run whose heartbeat is older than this is abandoned.
    pub lease_ttl: std::time::Duration,
}
