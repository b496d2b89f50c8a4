use std::path::Path;

use anyhow::{bail, Result};
use marketsync_engine::config::validator;
use marketsync_engine::{run_pipeline, PipelineError, RunSummary};
use marketsync_types::state::RunStatus;

/// Execute the `run` command: parse, validate, and run a pipeline once.
pub async fn execute(pipeline_path: &Path, chaos: bool) -> Result<()> {
    // 1. Parse pipeline YAML
    let mut config = super::load(pipeline_path)?;
    if chaos {
        config.chaos.enabled = true;
    }

    // 2. Validate
    validator::validate_pipeline(&config)?;

    tracing::info!(
        pipeline = config.pipeline,
        sources = config.sources.len(),
        chaos = config.chaos.enabled,
        "Pipeline validated"
    );

    // 3. Run
    let summary = match run_pipeline(&config).await {
        Ok(summary) => summary,
        Err(PipelineError::AlreadyRunning { run_id, .. }) => bail!(
            "Pipeline '{}' is already running (run {run_id}). Wait for it to finish, \
             or run `marketsync recover` if its process is gone.",
            config.pipeline
        ),
        Err(PipelineError::Aborted(abort)) => {
            println!("Pipeline '{}' aborted: {abort}", config.pipeline);
            println!("Committed progress is kept; the next run resumes from it.");
            bail!("Pipeline run aborted by fault injection")
        }
        Err(e) => return Err(e.into()),
    };

    print_summary(&config.pipeline, &summary);

    // Machine-readable summary for schedulers and scripts
    println!("{}", summary.to_json_line());

    if summary.status == RunStatus::Failed {
        bail!("Pipeline run {} failed", summary.run_id);
    }
    Ok(())
}

fn print_summary(pipeline: &str, summary: &RunSummary) {
    println!("Pipeline '{pipeline}' finished: {}", summary.status);
    match summary.resumed_from {
        Some(previous) => println!("  Run:               {} (resumed from run {previous})", summary.run_id),
        None => println!("  Run:               {}", summary.run_id),
    }
    println!("  Records processed: {}", summary.records_processed);
    println!("  Records failed:    {}", summary.records_failed);
    if summary.records_skipped > 0 {
        println!("  Records skipped:   {}", summary.records_skipped);
    }
    println!("  Duration:          {:.2}s", summary.duration.as_secs_f64());

    println!("  Sources:");
    for source in &summary.sources {
        if source.carried_over {
            println!("    {:20} {:10} (carried over)", source.source.as_str(), source.status.as_str());
            continue;
        }
        println!(
            "    {:20} {:10} processed={} failed={} skipped={} attempts={}",
            source.source.as_str(),
            source.status.as_str(),
            source.records_processed,
            source.records_failed,
            source.records_skipped,
            source.attempts
        );
        if let Some(err) = &source.error {
            println!("      error: {err}");
        }
    }

    if !summary.drift.is_empty() {
        println!("  Schema drift:");
        for (source, drift) in &summary.drift.sources {
            let keys: Vec<String> = drift
                .unexpected
                .iter()
                .map(|(key, count)| format!("{key} ({count})"))
                .collect();
            println!("    {:20} {}", source.as_str(), keys.join(", "));
        }
    }
}
