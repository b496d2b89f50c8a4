use std::path::Path;

use anyhow::Result;

const RECOVER_REASON: &str = "released by operator via `marketsync recover`";

/// Execute the `recover` command: fail a `running` run whose process died,
/// so the next trigger resumes immediately instead of waiting for the lease.
pub fn execute(pipeline_path: &Path) -> Result<()> {
    let config = super::load(pipeline_path)?;
    let (pipeline, state) = super::open_state(&config)?;

    match state.abandon_running(&pipeline, RECOVER_REASON)? {
        Some(run_id) => {
            tracing::warn!(pipeline = %pipeline, run_id, "Running run released by operator");
            println!("Run {run_id} of '{pipeline}' marked failed; the next run resumes from it.");
        }
        None => println!("No running run for pipeline '{pipeline}'."),
    }
    Ok(())
}
