//! Metric names and emit helpers.
//!
//! Everything goes through the `metrics` facade. The engine installs no
//! recorder; the embedding process decides how (and whether) to expose
//! them to a pull-based collector.

use std::time::Duration;

use marketsync_types::state::{RunStatus, SourceName};
use ::metrics::{counter, gauge, histogram};

pub const RECORDS_PROCESSED: &str = "marketsync_records_processed_total";
pub const RECORDS_FAILED: &str = "marketsync_records_failed_total";
pub const RECORDS_SKIPPED: &str = "marketsync_records_skipped_total";
pub const FETCH_ATTEMPTS: &str = "marketsync_fetch_attempts_total";
pub const DRIFT_FIELDS: &str = "marketsync_drift_fields_total";
pub const RUN_DURATION: &str = "marketsync_run_duration_seconds";
pub const SOURCE_STATUS: &str = "marketsync_source_status";
pub const RUNS: &str = "marketsync_runs_total";

/// Outcome label of one fetch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Retry,
    Failed,
}

impl AttemptOutcome {
    fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Retry => "retry",
            Self::Failed => "failed",
        }
    }
}

pub fn fetch_attempt(source: &SourceName, outcome: AttemptOutcome) {
    counter!(FETCH_ATTEMPTS, "source" => source.to_string(), "outcome" => outcome.as_str())
        .increment(1);
}

pub fn records(source: &SourceName, processed: u64, failed: u64, skipped: u64) {
    if processed > 0 {
        counter!(RECORDS_PROCESSED, "source" => source.to_string()).increment(processed);
    }
    if failed > 0 {
        counter!(RECORDS_FAILED, "source" => source.to_string()).increment(failed);
    }
    if skipped > 0 {
        counter!(RECORDS_SKIPPED, "source" => source.to_string()).increment(skipped);
    }
}

pub fn drift_fields(source: &SourceName, count: usize) {
    counter!(DRIFT_FIELDS, "source" => source.to_string()).increment(count as u64);
}

pub fn source_status(source: &SourceName, completed: bool) {
    gauge!(SOURCE_STATUS, "source" => source.to_string()).set(if completed { 1.0 } else { 0.0 });
}

pub fn run_finished(status: RunStatus, duration: Duration) {
    counter!(RUNS, "status" => status.as_str()).increment(1);
    histogram!(RUN_DURATION).record(duration.as_secs_f64());
}
