pub mod check;
pub mod recover;
pub mod run;
pub mod runs;
pub mod status;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use marketsync_engine::config::parser;
use marketsync_engine::config::types::PipelineConfig;
use marketsync_engine::resolve::create_state_backend;
use marketsync_state::StateBackend;
use marketsync_types::state::{Checkpoint, PipelineId};

/// Parse a pipeline file with environment overrides applied.
pub(crate) fn load(pipeline_path: &Path) -> Result<PipelineConfig> {
    parser::load_pipeline(pipeline_path)
        .with_context(|| format!("Failed to parse pipeline: {}", pipeline_path.display()))
}

/// Open the state backend a pipeline file points at.
pub(crate) fn open_state(config: &PipelineConfig) -> Result<(PipelineId, Arc<dyn StateBackend>)> {
    let state = create_state_backend(config).context("Failed to open state backend")?;
    Ok((PipelineId::new(config.pipeline.clone()), state))
}

pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

pub(crate) fn print_checkpoint(checkpoint: &Checkpoint) {
    println!("Run {} of '{}': {}", checkpoint.run_id, checkpoint.pipeline, checkpoint.status);
    println!("  Started:           {}", format_ts(checkpoint.started_at));
    match checkpoint.finished_at {
        Some(finished) => println!("  Finished:          {}", format_ts(finished)),
        None => println!(
            "  Heartbeat:         {} (owner {})",
            format_ts(checkpoint.heartbeat_at),
            checkpoint.owner
        ),
    }
    if let Some(previous) = checkpoint.resumed_from {
        println!("  Resumed from:      run {previous}");
    }
    println!("  Records processed: {}", checkpoint.records_processed);
    println!("  Records failed:    {}", checkpoint.records_failed);
    if let Some(err) = &checkpoint.last_error {
        println!("  Last error:        {err}");
    }

    println!("  Sources:");
    for source in &checkpoint.sources {
        let carried = if source.carried_over { " (carried over)" } else { "" };
        println!(
            "    {:20} {:10} processed={} failed={} skipped={}{}",
            source.source.as_str(),
            source.status.as_str(),
            source.records_processed,
            source.records_failed,
            source.records_skipped,
            carried
        );
        if let Some(err) = &source.error {
            println!("      error: {err}");
        }
    }
}
