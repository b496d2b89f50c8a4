use std::path::Path;

use anyhow::Result;

/// Execute the `runs` command: print run history, newest first.
pub fn execute(pipeline_path: &Path, limit: usize) -> Result<()> {
    let config = super::load(pipeline_path)?;
    let (pipeline, state) = super::open_state(&config)?;

    let runs = state.list_runs(&pipeline, limit)?;
    if runs.is_empty() {
        println!("No runs recorded for pipeline '{pipeline}'.");
        return Ok(());
    }

    println!(
        "{:>6}  {:10} {:24} {:24} {:>10} {:>8}  RESUMED",
        "RUN", "STATUS", "STARTED", "FINISHED", "PROCESSED", "FAILED"
    );
    for run in &runs {
        let finished = run
            .finished_at
            .map_or_else(|| "-".to_string(), super::format_ts);
        let resumed = run
            .resumed_from
            .map_or_else(|| "-".to_string(), |id| id.to_string());
        println!(
            "{:>6}  {:10} {:24} {:24} {:>10} {:>8}  {}",
            run.run_id,
            run.status.as_str(),
            super::format_ts(run.started_at),
            finished,
            run.records_processed,
            run.records_failed,
            resumed
        );
    }
    Ok(())
}
