//! Run-level error model.

use marketsync_state::StateError;
use marketsync_types::state::PipelineId;

use crate::chaos::ChaosAbort;

// ---------------------------------------------------------------------------
// PipelineError: what the trigger caller can see
// ---------------------------------------------------------------------------

/// Run-level failure surfaced to the trigger caller.
///
/// Per-record and per-source failures never appear here; they are folded
/// into the run's terminal status. Only the conditions below abort a
/// trigger.
#[derive(Debug)]
pub enum PipelineError {
    /// Another run of this pipeline holds the `running` slot. Nothing was
    /// written.
    AlreadyRunning { pipeline: PipelineId, run_id: i64 },
    /// Injected chaos abort. Committed progress stays resumable.
    Aborted(ChaosAbort),
    /// Checkpoint or record store failure.
    State(StateError),
    /// Infrastructure error (task panics, configuration, adapter setup).
    Infrastructure(anyhow::Error),
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyRunning { pipeline, run_id } => write!(
                f,
                "pipeline '{pipeline}' is already running (run {run_id})"
            ),
            Self::Aborted(e) => write!(f, "{e}"),
            Self::State(e) => write!(f, "state backend error: {e}"),
            Self::Infrastructure(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Aborted(e) => Some(e),
            Self::State(e) => Some(e),
            Self::AlreadyRunning { .. } | Self::Infrastructure(_) => None,
        }
    }
}

impl From<anyhow::Error> for PipelineError {
    fn from(e: anyhow::Error) -> Self {
        Self::Infrastructure(e)
    }
}

impl From<StateError> for PipelineError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::AlreadyRunning { pipeline, run_id } => {
                Self::AlreadyRunning { pipeline, run_id }
            }
            other => Self::State(other),
        }
    }
}

impl From<ChaosAbort> for PipelineError {
    fn from(e: ChaosAbort) -> Self {
        Self::Aborted(e)
    }
}

impl PipelineError {
    /// Returns `true` when re-triggering later can succeed without operator
    /// action: a concurrent run will finish, an aborted run resumes.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::AlreadyRunning { .. } | Self::Aborted(_))
    }

    pub fn is_already_running(&self) -> bool {
        matches!(self, Self::AlreadyRunning { .. })
    }

    pub fn as_chaos_abort(&self) -> Option<&ChaosAbort> {
        match self {
            Self::Aborted(e) => Some(e),
            _ => None,
        }
    }
}

/// Lift a join error from `spawn_blocking` into an infrastructure error.
pub(crate) fn task_panicked(task: &str, err: &tokio::task::JoinError) -> PipelineError {
    PipelineError::Infrastructure(anyhow::anyhow!("{task} task panicked: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use marketsync_types::state::SourceName;

    #[test]
    fn test_state_already_running_maps_to_dedicated_variant() {
        let err: PipelineError = StateError::AlreadyRunning {
            pipeline: PipelineId::new("crypto"),
            run_id: 4,
        }
        .into();
        assert!(err.is_already_running());
        assert!(err.is_retryable());
        assert!(err.to_string().contains("already running"));
    }

    #[test]
    fn test_other_state_errors_stay_state() {
        let err: PipelineError = StateError::LockPoisoned.into();
        assert!(matches!(err, PipelineError::State(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_pipeline_error_from_anyhow() {
        let pe: PipelineError = anyhow::anyhow!("something went wrong").into();
        assert!(matches!(pe, PipelineError::Infrastructure(_)));
        assert!(!pe.is_retryable());
        assert_eq!(pe.to_string(), "something went wrong");
    }

    #[test]
    fn test_chaos_abort_display_and_accessor() {
        let err = PipelineError::from(ChaosAbort {
            source_name: SourceName::new("coingecko"),
            position: 6,
            total: 10,
        });
        assert!(err.as_chaos_abort().is_some());
        assert!(err.to_string().contains("coingecko"));
    }
}
