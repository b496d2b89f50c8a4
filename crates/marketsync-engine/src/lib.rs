//! Core ingestion engine for marketsync.
//!
//! Drives source adapters through retry, drift detection, normalization,
//! and idempotent upserts, checkpointing progress so an aborted run can be
//! resumed.

pub mod chaos;
pub mod checkpoint;
pub mod config;
pub(crate) mod dlq;
pub mod drift;
pub mod errors;
pub mod metrics;
pub mod normalize;
pub mod orchestrator;
pub mod resolve;
pub mod result;
pub mod retry;
pub mod source;
pub mod writer;

// Re-export public API for convenience
pub use errors::PipelineError;
pub use orchestrator::{check_pipeline, run_pipeline, Orchestrator};
pub use result::{CheckResult, RunSummary, SourceOutcome};
