//! Pipeline orchestrator: drives every source of one run from fetch to
//! checkpoint and decides the run's terminal status.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use marketsync_state::{RejectedRecord, StateBackend};
use marketsync_types::drift::DriftReport;
use marketsync_types::error::ErrorCategory;
use marketsync_types::record::{Observation, RawPayload};
use marketsync_types::state::{
    NewRun, PipelineId, ProgressUpdate, RunError, RunStatus, SourceName, SourceStatus,
};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

use crate::chaos::{ChaosInjector, ChaosStrategy};
use crate::checkpoint::{plan_resume, state_call, ResumePlan, SourceCursor};
use crate::config::types::{PipelineConfig, SourceKind};
use crate::drift::DriftDetector;
use crate::errors::{task_panicked, PipelineError};
use crate::metrics;
use crate::normalize::normalize;
use crate::resolve::{build_adapter, build_adapters, check_state_backend, create_state_backend};
use crate::result::{CheckResult, RunSummary, SourceOutcome};
use crate::retry::{call_with_retry, RetryPolicy};
use crate::source::SourceAdapter;
use crate::writer::{IngestClock, UpsertWriter};

/// Everything a source task needs, shared across the run's tasks.
struct RunContext {
    pipeline: PipelineId,
    run_id: i64,
    state: Arc<dyn StateBackend>,
    writer: UpsertWriter,
    chaos: Arc<ChaosInjector>,
    retry: RetryPolicy,
    batch_size: usize,
}

/// Output of one source task.
struct SourceRunResult {
    outcome: SourceOutcome,
    drift: DriftReport,
}

struct SourceTaskCollection {
    successes: Vec<SourceRunResult>,
    first_error: Option<PipelineError>,
}

/// Drives runs of one pipeline against a state backend.
pub struct Orchestrator {
    config: PipelineConfig,
    pipeline: PipelineId,
    state: Arc<dyn StateBackend>,
    adapters: Vec<Arc<dyn SourceAdapter>>,
    chaos: Arc<ChaosInjector>,
    retry: RetryPolicy,
    clock: Arc<IngestClock>,
    owner: String,
}

impl Orchestrator {
    /// Adapter names must be unique; they key checkpoints and metrics.
    #[must_use]
    pub fn new(
        config: PipelineConfig,
        state: Arc<dyn StateBackend>,
        adapters: Vec<Arc<dyn SourceAdapter>>,
        chaos: ChaosInjector,
    ) -> Self {
        let retry = RetryPolicy::from_resources(&config.resources);
        Self {
            pipeline: PipelineId::new(config.pipeline.clone()),
            owner: format!("pid-{}-{}", std::process::id(), uuid::Uuid::new_v4()),
            config,
            state,
            adapters,
            chaos: Arc::new(chaos),
            retry,
            clock: Arc::new(IngestClock::new()),
        }
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    #[must_use]
    pub fn pipeline(&self) -> &PipelineId {
        &self.pipeline
    }

    /// Execute one run.
    ///
    /// Per-record and per-source failures are folded into the returned
    /// summary's status. A chaos abort returns [`PipelineError::Aborted`]
    /// and closes the run as `failed` with its committed progress intact,
    /// so the next run resumes from it.
    ///
    /// # Errors
    ///
    /// [`PipelineError::AlreadyRunning`] when another live run holds the
    /// pipeline, [`PipelineError::Aborted`] on an injected crash, and
    /// [`PipelineError::State`] / [`PipelineError::Infrastructure`] on
    /// structural failures.
    pub async fn run(&self) -> Result<RunSummary, PipelineError> {
        let start = Instant::now();
        tracing::info!(
            pipeline = self.pipeline.as_str(),
            sources = self.adapters.len(),
            chaos = self.chaos.is_enabled(),
            "Starting pipeline run"
        );

        let names: Vec<SourceName> = self.adapters.iter().map(|a| a.name().clone()).collect();
        let pipeline = self.pipeline.clone();
        let latest =
            state_call("load_latest", &self.state, move |s| s.load_latest(&pipeline)).await?;
        let plan = plan_resume(latest.as_ref(), &names);

        let new_run = NewRun {
            pipeline: self.pipeline.clone(),
            sources: names,
            carried: plan.carried.clone(),
            resumed_from: plan.resumed_from,
            owner: self.owner.clone(),
            lease_ttl: self.config.resources.lease_ttl(),
        };
        let run_id = state_call("create_run", &self.state, move |s| s.create_run(&new_run)).await?;
        let _heartbeat =
            LeaseHeartbeat::spawn(self.state.clone(), run_id, self.config.resources.lease_ttl());
        if let Some(previous) = plan.resumed_from {
            tracing::info!(
                pipeline = self.pipeline.as_str(),
                run_id,
                resumed_from = previous,
                carried_sources = plan.carried.len(),
                "Resuming unfinished run"
            );
        }

        let ctx = Arc::new(RunContext {
            pipeline: self.pipeline.clone(),
            run_id,
            state: self.state.clone(),
            writer: UpsertWriter::new(self.state.clone(), self.clock.clone()),
            chaos: self.chaos.clone(),
            retry: self.retry.clone(),
            batch_size: self.config.resources.batch_size.max(1),
        });

        let collection = match self.execute_sources(&ctx, &plan).await {
            Ok(collection) => collection,
            Err(err) => return Err(self.fail_run(run_id, err).await),
        };
        if let Some(err) = collection.first_error {
            return Err(self.fail_run(run_id, err).await);
        }

        self.finish_run(run_id, start, &plan, collection.successes)
            .await
    }

    async fn execute_sources(
        &self,
        ctx: &Arc<RunContext>,
        plan: &ResumePlan,
    ) -> Result<SourceTaskCollection, PipelineError> {
        let semaphore = Arc::new(Semaphore::new(self.config.resources.concurrency.max(1)));
        let mut join_set: JoinSet<Result<SourceRunResult, PipelineError>> = JoinSet::new();

        for adapter in &self.adapters {
            if plan.is_carried(adapter.name()) {
                tracing::info!(
                    source = %adapter.name(),
                    run_id = ctx.run_id,
                    "Source completed by previous run, skipping"
                );
                continue;
            }
            let adapter = adapter.clone();
            let ctx = ctx.clone();
            let semaphore = semaphore.clone();
            let cursor = plan.start_cursor(adapter.name());
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.map_err(|e| {
                    PipelineError::Infrastructure(anyhow::anyhow!("Semaphore closed: {e}"))
                })?;
                process_source(&ctx, adapter.as_ref(), cursor).await
            });
        }

        collect_source_task_results(join_set).await
    }

    /// Structural failure or chaos abort. The run is finalized as failed
    /// when the store still answers; committed progress stays resumable.
    async fn fail_run(&self, run_id: i64, err: PipelineError) -> PipelineError {
        if err.is_already_running() {
            return err;
        }

        let run_error = match err.as_chaos_abort() {
            Some(abort) => {
                tracing::error!(
                    pipeline = self.pipeline.as_str(),
                    run_id,
                    source = %abort.source_name,
                    "Run aborted, committed progress left resumable"
                );
                RunError::new(ErrorCategory::Chaos, abort.to_string())
                    .for_source(abort.source_name.clone())
            }
            None => {
                tracing::error!(
                    pipeline = self.pipeline.as_str(),
                    run_id,
                    error = %err,
                    "Pipeline run failed"
                );
                RunError::new(ErrorCategory::Internal, err.to_string())
            }
        };
        let finalized = state_call("finalize", &self.state, move |s| {
            s.finalize(run_id, RunStatus::Failed, Some(&run_error))
        })
        .await;
        if let Err(e) = finalized {
            tracing::error!(
                pipeline = self.pipeline.as_str(),
                run_id,
                error = %e,
                "Failed to finalize run after structural failure"
            );
        }
        err
    }

    async fn finish_run(
        &self,
        run_id: i64,
        start: Instant,
        plan: &ResumePlan,
        results: Vec<SourceRunResult>,
    ) -> Result<RunSummary, PipelineError> {
        let mut drift = DriftReport::new();
        let mut by_name = std::collections::HashMap::new();
        for result in results {
            drift.merge(result.drift);
            by_name.insert(result.outcome.source.clone(), result.outcome);
        }

        // Configuration order, carried sources included.
        let sources: Vec<SourceOutcome> = self
            .adapters
            .iter()
            .map(|a| {
                by_name
                    .remove(a.name())
                    .unwrap_or_else(|| SourceOutcome::carried(a.name().clone()))
            })
            .collect();

        let completed = sources.iter().filter(|s| s.is_completed()).count();
        let failed = sources.len() - completed;
        let status = RunStatus::from_outcomes(completed, failed);
        let last_error = sources.iter().rev().find_map(|s| s.error.clone());

        let finalize_error = last_error.clone();
        state_call("finalize", &self.state, move |s| {
            s.finalize(run_id, status, finalize_error.as_ref())
        })
        .await?;

        let duration = start.elapsed();
        let summary = RunSummary {
            run_id,
            status,
            records_processed: sources.iter().map(|s| s.records_processed).sum(),
            records_failed: sources.iter().map(|s| s.records_failed).sum(),
            records_skipped: sources.iter().map(|s| s.records_skipped).sum(),
            duration,
            resumed_from: plan.resumed_from,
            sources,
            drift,
        };
        metrics::run_finished(status, duration);
        tracing::info!(
            pipeline = self.pipeline.as_str(),
            run_id,
            status = %status,
            records_processed = summary.records_processed,
            records_failed = summary.records_failed,
            records_skipped = summary.records_skipped,
            sources_completed = completed,
            sources_failed = failed,
            duration_secs = duration.as_secs_f64(),
            last_error = last_error.as_ref().map(ToString::to_string),
            "Pipeline run finished"
        );
        Ok(summary)
    }
}

/// Drive one source: fetch with retry, then drift, normalize, and commit
/// in batches, checkpointing after each batch.
async fn process_source(
    ctx: &RunContext,
    adapter: &dyn SourceAdapter,
    start_cursor: SourceCursor,
) -> Result<SourceRunResult, PipelineError> {
    let name = adapter.name().clone();
    let mut outcome = SourceOutcome {
        source: name.clone(),
        status: SourceStatus::Pending,
        records_processed: 0,
        records_failed: 0,
        records_skipped: 0,
        attempts: 0,
        carried_over: false,
        error: None,
    };
    let mut detector = DriftDetector::new(name.clone(), ctx.run_id, adapter.expected_fields());

    let report = call_with_retry(&ctx.retry, &name, || adapter.fetch()).await;
    outcome.attempts = report.attempt_count();
    let payloads = match report.result {
        Ok(payloads) => payloads,
        Err(err) => {
            let run_error = RunError::new(err.category, format!("{}: {}", err.code, err.message))
                .for_source(name.clone());
            let update = ProgressUpdate {
                status: SourceStatus::Failed,
                cursor: None,
                delta_processed: 0,
                delta_failed: 0,
                delta_skipped: 0,
                error: Some(run_error.clone()),
            };
            let (run_id, source) = (ctx.run_id, name.clone());
            state_call("update_progress", &ctx.state, move |s| {
                s.update_progress(run_id, &source, &update)
            })
            .await?;
            metrics::source_status(&name, false);
            outcome.status = SourceStatus::Failed;
            outcome.error = Some(run_error);
            return Ok(SourceRunResult {
                outcome,
                drift: detector.into_report(),
            });
        }
    };

    let total = payloads.len() as u64;
    let mut cursor = resume_cursor(adapter, start_cursor, total);
    let skip = usize::try_from(cursor.offset).unwrap_or(payloads.len());

    let watermark = if adapter.incremental() {
        let (pipeline, source) = (ctx.pipeline.clone(), name.clone());
        state_call("get_watermark", &ctx.state, move |s| {
            s.get_watermark(&pipeline, &source)
        })
        .await?
    } else {
        None
    };

    for chunk in payloads[skip..].chunks(ctx.batch_size) {
        let batch = prepare_batch(ctx, adapter, &mut detector, chunk, watermark);
        let consumed = chunk.len() as u64;

        ctx.chaos.before_commit(&name, cursor.offset + consumed, total)?;

        let processed = batch.observations.len() as u64;
        let failed = batch.rejected.len() as u64;
        ctx.writer.write(&name, batch.observations).await?;

        cursor.advance(consumed, batch.newest);
        let update = ProgressUpdate {
            status: SourceStatus::Pending,
            cursor: Some(cursor.encode()),
            delta_processed: processed,
            delta_failed: failed,
            delta_skipped: batch.skipped,
            error: None,
        };
        let (run_id, source) = (ctx.run_id, name.clone());
        state_call("update_progress", &ctx.state, move |s| {
            s.update_progress(run_id, &source, &update)
        })
        .await?;

        if !batch.rejected.is_empty() {
            let state = ctx.state.clone();
            let (pipeline, run_id) = (ctx.pipeline.clone(), ctx.run_id);
            let rejected = batch.rejected;
            tokio::task::spawn_blocking(move || {
                crate::dlq::persist_rejected_records(state.as_ref(), &pipeline, run_id, &rejected);
            })
            .await
            .map_err(|e| task_panicked("persist_rejected_records", &e))?;
        }

        metrics::records(&name, processed, failed, batch.skipped);
        outcome.records_processed += processed;
        outcome.records_failed += failed;
        outcome.records_skipped += batch.skipped;
    }

    if let (true, Some(high_watermark)) = (adapter.incremental(), cursor.high_watermark) {
        let (pipeline, source) = (ctx.pipeline.clone(), name.clone());
        state_call("advance_watermark", &ctx.state, move |s| {
            s.advance_watermark(&pipeline, &source, high_watermark)
        })
        .await?;
    }

    let update = ProgressUpdate {
        status: SourceStatus::Completed,
        cursor: Some(cursor.encode()),
        delta_processed: 0,
        delta_failed: 0,
        delta_skipped: 0,
        error: None,
    };
    let (run_id, source) = (ctx.run_id, name.clone());
    state_call("update_progress", &ctx.state, move |s| {
        s.update_progress(run_id, &source, &update)
    })
    .await?;
    metrics::source_status(&name, true);
    tracing::info!(
        source = %name,
        run_id = ctx.run_id,
        fetched = total,
        records_processed = outcome.records_processed,
        records_failed = outcome.records_failed,
        records_skipped = outcome.records_skipped,
        "Source completed"
    );

    outcome.status = SourceStatus::Completed;
    Ok(SourceRunResult {
        outcome,
        drift: detector.into_report(),
    })
}

/// Where a source restarts. Only a replayable adapter may skip the prefix
/// an earlier run committed; every other adapter starts from scratch.
fn resume_cursor(adapter: &dyn SourceAdapter, start: SourceCursor, total: u64) -> SourceCursor {
    if start.offset == 0 {
        return SourceCursor::default();
    }
    if !adapter.replayable() {
        tracing::debug!(
            source = %adapter.name(),
            committed = start.offset,
            "Source is not replayable, re-processing from the start"
        );
        return SourceCursor::default();
    }
    if start.offset > total {
        tracing::warn!(
            source = %adapter.name(),
            committed = start.offset,
            fetched = total,
            "Committed offset beyond fetched payloads, re-processing from the start"
        );
        return SourceCursor::default();
    }
    tracing::info!(
        source = %adapter.name(),
        offset = start.offset,
        "Resuming source from committed offset"
    );
    start
}

struct PreparedBatch {
    observations: Vec<Observation>,
    rejected: Vec<RejectedRecord>,
    skipped: u64,
    newest: Option<DateTime<Utc>>,
}

/// Drift-check and normalize one chunk in fetch order. Never fails: a
/// rejected payload is logged and kept for the dead-letter table.
fn prepare_batch(
    ctx: &RunContext,
    adapter: &dyn SourceAdapter,
    detector: &mut DriftDetector,
    chunk: &[RawPayload],
    watermark: Option<DateTime<Utc>>,
) -> PreparedBatch {
    let name = adapter.name();
    let mut batch = PreparedBatch {
        observations: Vec::with_capacity(chunk.len()),
        rejected: Vec::new(),
        skipped: 0,
        newest: None,
    };

    for payload in chunk {
        detector.inspect(payload);
        match normalize(payload, adapter.mapping(), name) {
            Ok(observation) => {
                if watermark.is_some_and(|wm| observation.observed_at <= wm) {
                    batch.skipped += 1;
                    continue;
                }
                batch.newest = batch.newest.max(Some(observation.observed_at));
                batch.observations.push(observation);
            }
            Err(e) => {
                let payload_json = payload.to_json();
                tracing::warn!(
                    source = %name,
                    run_id = ctx.run_id,
                    error = %e,
                    payload = %payload_json,
                    "Record failed validation"
                );
                batch.rejected.push(RejectedRecord {
                    source: name.clone(),
                    payload_json,
                    error_message: e.to_string(),
                    error_category: ErrorCategory::Validation,
                    failed_at: Utc::now(),
                });
            }
        }
    }
    batch
}

/// Keeps the run's lease fresh while the run is in flight; stops on drop.
struct LeaseHeartbeat(Option<JoinHandle<()>>);

impl LeaseHeartbeat {
    fn spawn(state: Arc<dyn StateBackend>, run_id: i64, lease_ttl: Duration) -> Self {
        let period = lease_ttl / 3;
        if period.is_zero() {
            return Self(None);
        }
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately; create_run just stamped the lease.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match state_call("heartbeat", &state, move |s| s.heartbeat(run_id)).await {
                    Ok(true) => tracing::trace!(run_id, "Run lease refreshed"),
                    Ok(false) => {
                        tracing::debug!(run_id, "Run no longer running, heartbeat stopped");
                        break;
                    }
                    Err(e) => tracing::warn!(run_id, error = %e, "Failed to refresh run lease"),
                }
            }
        });
        Self(Some(handle))
    }
}

impl Drop for LeaseHeartbeat {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

async fn collect_source_task_results(
    mut join_set: JoinSet<Result<SourceRunResult, PipelineError>>,
) -> Result<SourceTaskCollection, PipelineError> {
    let mut successes = Vec::new();
    let mut first_error: Option<PipelineError> = None;

    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(Ok(result)) if first_error.is_none() => successes.push(result),
            Ok(Ok(_)) => {}
            Ok(Err(error)) => {
                if first_error.is_none() {
                    tracing::error!(error = %error, "Source task failed, stopping run");
                    first_error = Some(error);
                    join_set.abort_all();
                }
            }
            Err(join_err) if join_err.is_cancelled() && first_error.is_some() => {
                // Sibling tasks cancelled after the first failure.
            }
            Err(join_err) => return Err(task_panicked("source", &join_err)),
        }
    }

    Ok(SourceTaskCollection {
        successes,
        first_error,
    })
}

/// Build the configured adapters and state backend, then execute one run.
///
/// # Errors
///
/// See [`Orchestrator::run`]; setup failures are
/// [`PipelineError::Infrastructure`].
pub async fn run_pipeline(config: &PipelineConfig) -> Result<RunSummary, PipelineError> {
    let state = create_state_backend(config).map_err(PipelineError::Infrastructure)?;
    let adapters = build_adapters(config).map_err(PipelineError::Infrastructure)?;
    let chaos = ChaosInjector::new(ChaosStrategy::from_config(&config.chaos));
    Orchestrator::new(config.clone(), state, adapters, chaos)
        .run()
        .await
}

/// Verify that every source can be built and the state backend opens.
///
/// Nothing is fetched: upstream availability is a run-time concern.
///
/// # Errors
///
/// Currently infallible; problems are reported in the [`CheckResult`].
pub async fn check_pipeline(config: &PipelineConfig) -> Result<CheckResult> {
    tracing::info!(
        pipeline = config.pipeline,
        "Checking pipeline configuration"
    );

    let mut sources = Vec::with_capacity(config.sources.len());
    for source in &config.sources {
        let name = SourceName::new(source.name.clone());
        let result = match build_adapter(source, config) {
            Err(e) => Err(format!("{e:#}")),
            Ok(_) if source.kind == SourceKind::Csv => {
                let path = source.path.clone().unwrap_or_default();
                if std::path::Path::new(&path).is_file() {
                    Ok(())
                } else {
                    Err(format!("CSV file not found: {path}"))
                }
            }
            Ok(_) => Ok(()),
        };
        match &result {
            Ok(()) => tracing::info!(source = source.name, "Source: OK"),
            Err(e) => tracing::error!(source = source.name, error = %e, "Source: FAILED"),
        }
        sources.push((name, result));
    }

    let config_for_state = config.clone();
    let state_ok = tokio::task::spawn_blocking(move || check_state_backend(&config_for_state))
        .await
        .map_err(|e| anyhow::anyhow!("State check task panicked: {e}"))?;

    Ok(CheckResult { sources, state_ok })
}
