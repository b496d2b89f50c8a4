//! Storage contracts.
//!
//! The orchestrator talks to storage only through these traits. Model types
//! live in [`marketsync_types`]; the helper structs below are specific to
//! the storage boundary.

use std::time::Duration;

use chrono::{DateTime, Utc};
use marketsync_types::error::ErrorCategory;
use marketsync_types::record::{RecordKey, UnifiedRecord};
use marketsync_types::state::{
    Checkpoint, NewRun, PipelineId, ProgressUpdate, RunError, RunStatus, SourceName,
};

use crate::error;

/// Outcome counts of one [`RecordStore::upsert_batch`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertSummary {
    /// Keys that did not exist before.
    pub inserted: u64,
    /// Existing keys overwritten by a newer `ingested_at`.
    pub updated: u64,
    /// Existing keys left alone because the stored row was as new or newer.
    pub unchanged: u64,
}

impl UpsertSummary {
    #[must_use]
    pub fn written(&self) -> u64 {
        self.inserted + self.updated
    }

    pub fn absorb(&mut self, other: UpsertSummary) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
    }
}

/// A payload the normalizer rejected, kept for inspection.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedRecord {
    pub source: SourceName,
    pub payload_json: String,
    pub error_message: String,
    pub error_category: ErrorCategory,
    pub failed_at: DateTime<Utc>,
}

/// Durable run lifecycle (checkpoints).
///
/// Every mutation is a single transaction, so a concurrent reader sees
/// either the state before or after an update, never a mix.
pub trait CheckpointStore: Send + Sync {
    /// Open a new `running` run and return its id.
    ///
    /// A `running` run whose heartbeat is older than `new_run.lease_ttl` is
    /// finalized as `failed` (category `abandoned`) first.
    ///
    /// # Errors
    ///
    /// [`StateError::AlreadyRunning`](crate::StateError::AlreadyRunning) when
    /// a live run holds the pipeline; nothing is written in that case.
    fn create_run(&self, new_run: &NewRun) -> error::Result<i64>;

    /// Apply counter deltas and the new cursor for one source, and refresh
    /// the run heartbeat.
    ///
    /// # Errors
    ///
    /// Fails if the run is unknown or no longer `running`.
    fn update_progress(
        &self,
        run_id: i64,
        source: &SourceName,
        update: &ProgressUpdate,
    ) -> error::Result<()>;

    /// Refresh the heartbeat of a `running` run without touching its
    /// progress. Returns `false` once the run is no longer `running`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn heartbeat(&self, run_id: i64) -> error::Result<bool>;

    /// Move a run to a terminal status.
    ///
    /// Repeating the call with the status already stored is a no-op.
    ///
    /// # Errors
    ///
    /// [`StateError::InvalidTransition`](crate::StateError::InvalidTransition)
    /// for a non-terminal target or a different terminal status.
    fn finalize(
        &self,
        run_id: i64,
        status: RunStatus,
        error: Option<&RunError>,
    ) -> error::Result<()>;

    /// Newest run of `pipeline`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn load_latest(&self, pipeline: &PipelineId) -> error::Result<Option<Checkpoint>>;

    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn get_run(&self, run_id: i64) -> error::Result<Option<Checkpoint>>;

    /// Newest-first run history.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn list_runs(&self, pipeline: &PipelineId, limit: usize) -> error::Result<Vec<Checkpoint>>;

    /// Finalize the pipeline's `running` run as abandoned regardless of its
    /// lease. Returns the run id that was closed.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn abandon_running(&self, pipeline: &PipelineId, reason: &str) -> error::Result<Option<i64>>;
}

/// Unified record storage keyed by `(symbol, observed_at)`.
pub trait RecordStore: Send + Sync {
    /// Insert each record, or overwrite the stored row when the incoming
    /// `ingested_at` is strictly newer. The batch is one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure; no
    /// record of the batch is written in that case.
    fn upsert_batch(&self, records: &[UnifiedRecord]) -> error::Result<UpsertSummary>;

    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn get_record(&self, key: &RecordKey) -> error::Result<Option<UnifiedRecord>>;

    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn count_records(&self) -> error::Result<u64>;

    /// Every stored record ordered by key.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn list_records(&self) -> error::Result<Vec<UnifiedRecord>>;
}

/// High-watermarks for incremental sources.
pub trait WatermarkStore: Send + Sync {
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn get_watermark(
        &self,
        pipeline: &PipelineId,
        source: &SourceName,
    ) -> error::Result<Option<DateTime<Utc>>>;

    /// Raise the watermark. A value not newer than the stored one is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn advance_watermark(
        &self,
        pipeline: &PipelineId,
        source: &SourceName,
        watermark: DateTime<Utc>,
    ) -> error::Result<()>;
}

/// Dead-letter storage for rejected payloads.
pub trait RejectStore: Send + Sync {
    /// Persist rejected payloads. Returns the count inserted.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn insert_rejected(
        &self,
        pipeline: &PipelineId,
        run_id: i64,
        records: &[RejectedRecord],
    ) -> error::Result<u64>;

    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn count_rejected(&self, pipeline: &PipelineId, run_id: i64) -> error::Result<u64>;
}

/// Everything a run needs from storage, usable as `Arc<dyn StateBackend>`.
pub trait StateBackend: CheckpointStore + RecordStore + WatermarkStore + RejectStore {}

impl<T> StateBackend for T where T: CheckpointStore + RecordStore + WatermarkStore + RejectStore {}

/// Lease expiry check shared by backends.
#[must_use]
pub fn lease_expired(heartbeat_at: DateTime<Utc>, now: DateTime<Utc>, ttl: Duration) -> bool {
    let Ok(ttl) = chrono::Duration::from_std(ttl) else {
        return false;
    };
    now.signed_duration_since(heartbeat_at) >= ttl
}
