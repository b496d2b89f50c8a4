//! Persistence of records the normalizer rejected.

use marketsync_state::{RejectedRecord, StateBackend};
use marketsync_types::state::PipelineId;

/// Persist rejected payloads. Failures are logged and never fail the run:
/// the rejection is already counted in `records_failed`.
pub(crate) fn persist_rejected_records(
    state_backend: &dyn StateBackend,
    pipeline: &PipelineId,
    run_id: i64,
    records: &[RejectedRecord],
) {
    if records.is_empty() {
        return;
    }

    let rejected_count = records.len();

    match state_backend.insert_rejected(pipeline, run_id, records) {
        Ok(inserted) => {
            tracing::info!(
                pipeline = pipeline.as_str(),
                run_id,
                rejected_records = inserted,
                "Persisted rejected records to state backend"
            );
        }
        Err(e) => {
            tracing::error!(
                pipeline = pipeline.as_str(),
                run_id,
                rejected_count,
                error = %e,
                "Failed to persist rejected records"
            );
        }
    }
}
