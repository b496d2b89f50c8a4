//! Per-source resume cursors and resume planning.
//!
//! A source's cursor is an opaque string to the checkpoint store. The
//! engine encodes it as `{"offset": n, "high_watermark": ts}`: `offset`
//! counts fetched payloads already committed, `high_watermark` is the
//! newest `observed_at` committed so far.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use marketsync_state::{StateBackend, StateError};
use marketsync_types::state::{Checkpoint, RunStatus, SourceName, SourceStatus};
use serde::Deserialize;

use crate::errors::{task_panicked, PipelineError};

/// Decoded per-source cursor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct SourceCursor {
    pub offset: u64,
    #[serde(default)]
    pub high_watermark: Option<DateTime<Utc>>,
}

impl SourceCursor {
    #[must_use]
    pub fn encode(&self) -> String {
        let mut value = serde_json::json!({ "offset": self.offset });
        if let Some(hw) = self.high_watermark {
            value["high_watermark"] =
                serde_json::Value::String(hw.to_rfc3339_opts(SecondsFormat::Micros, true));
        }
        value.to_string()
    }

    /// `None` for a cursor this engine did not write.
    #[must_use]
    pub fn decode(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }

    /// Account for `consumed` more payloads whose newest timestamp is
    /// `newest`.
    pub fn advance(&mut self, consumed: u64, newest: Option<DateTime<Utc>>) {
        self.offset += consumed;
        self.high_watermark = match (self.high_watermark, newest) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }
}

/// What a new run inherits from the previous, unfinished one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResumePlan {
    pub resumed_from: Option<i64>,
    /// Sources completed earlier; not fetched again.
    pub carried: Vec<(SourceName, Option<String>)>,
    /// Committed progress of sources that did not complete.
    pub partial: BTreeMap<SourceName, SourceCursor>,
}

impl ResumePlan {
    #[must_use]
    pub fn is_carried(&self, source: &SourceName) -> bool {
        self.carried.iter().any(|(name, _)| name == source)
    }

    /// Cursor a source starts from. Zero unless the previous run
    /// committed part of it.
    #[must_use]
    pub fn start_cursor(&self, source: &SourceName) -> SourceCursor {
        self.partial.get(source).copied().unwrap_or_default()
    }
}

/// Decide what to inherit from `latest`.
///
/// A `succeeded` run leaves nothing to resume. Any other status (failed,
/// partial, or a `running` run left behind by a crash) hands its completed
/// sources to the next run.
#[must_use]
pub fn plan_resume(latest: Option<&Checkpoint>, sources: &[SourceName]) -> ResumePlan {
    let Some(latest) = latest else {
        return ResumePlan::default();
    };
    if latest.status == RunStatus::Succeeded {
        return ResumePlan::default();
    }

    let mut plan = ResumePlan {
        resumed_from: Some(latest.run_id),
        ..ResumePlan::default()
    };
    for name in sources {
        let Some(previous) = latest.source(name) else {
            continue;
        };
        match previous.status {
            SourceStatus::Completed => plan.carried.push((name.clone(), previous.cursor.clone())),
            SourceStatus::Pending | SourceStatus::Failed => {
                if let Some(cursor) = previous.cursor.as_deref().and_then(SourceCursor::decode) {
                    if cursor.offset > 0 {
                        plan.partial.insert(name.clone(), cursor);
                    }
                }
            }
        }
    }
    plan
}

/// Run a blocking store call off the async runtime.
pub(crate) async fn state_call<T, F>(
    task: &'static str,
    state: &Arc<dyn StateBackend>,
    f: F,
) -> Result<T, PipelineError>
where
    T: Send + 'static,
    F: FnOnce(&dyn StateBackend) -> Result<T, StateError> + Send + 'static,
{
    let state = state.clone();
    let result = tokio::task::spawn_blocking(move || f(state.as_ref()))
        .await
        .map_err(|e| task_panicked(task, &e))?;
    result.map_err(PipelineError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use marketsync_types::state::{PipelineId, SourceCheckpoint};

    fn checkpoint(status: RunStatus, sources: Vec<SourceCheckpoint>) -> Checkpoint {
        let now = Utc::now();
        Checkpoint {
            run_id: 7,
            pipeline: PipelineId::new("crypto"),
            status,
            started_at: now,
            finished_at: None,
            records_processed: 0,
            records_failed: 0,
            sources,
            last_error: None,
            resumed_from: None,
            owner: "test".into(),
            heartbeat_at: now,
        }
    }

    fn source(name: &str, status: SourceStatus, cursor: Option<SourceCursor>) -> SourceCheckpoint {
        SourceCheckpoint {
            source: SourceName::new(name),
            status,
            cursor: cursor.map(|c| c.encode()),
            records_processed: 0,
            records_failed: 0,
            records_skipped: 0,
            carried_over: false,
            error: None,
            updated_at: Utc::now(),
        }
    }

    fn names(list: &[&str]) -> Vec<SourceName> {
        list.iter().map(|n| SourceName::new(*n)).collect()
    }

    #[test]
    fn test_cursor_encoding() {
        let cursor = SourceCursor {
            offset: 12,
            high_watermark: Some(Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap()),
        };
        let raw = cursor.encode();
        assert_eq!(
            raw,
            r#"{"high_watermark":"2024-01-15T10:00:00.000000Z","offset":12}"#
        );
        assert_eq!(SourceCursor::decode(&raw), Some(cursor));
        assert_eq!(SourceCursor::decode("opaque-token"), None);
        assert_eq!(
            SourceCursor::decode(r#"{"offset":3}"#),
            Some(SourceCursor {
                offset: 3,
                high_watermark: None
            })
        );
    }

    #[test]
    fn test_cursor_advance_keeps_newest() {
        let early = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let mut cursor = SourceCursor::default();
        cursor.advance(5, Some(late));
        cursor.advance(5, Some(early));
        cursor.advance(2, None);
        assert_eq!(cursor.offset, 12);
        assert_eq!(cursor.high_watermark, Some(late));
    }

    #[test]
    fn test_no_previous_run_means_fresh_start() {
        assert_eq!(plan_resume(None, &names(&["a"])), ResumePlan::default());
    }

    #[test]
    fn test_succeeded_run_is_not_resumed() {
        let latest = checkpoint(
            RunStatus::Succeeded,
            vec![source("a", SourceStatus::Completed, None)],
        );
        assert_eq!(plan_resume(Some(&latest), &names(&["a"])), ResumePlan::default());
    }

    #[test]
    fn test_completed_sources_are_carried_and_partial_offsets_kept() {
        let done = SourceCursor {
            offset: 10,
            high_watermark: None,
        };
        let half = SourceCursor {
            offset: 4,
            high_watermark: None,
        };
        let latest = checkpoint(
            RunStatus::Running,
            vec![
                source("a", SourceStatus::Completed, Some(done)),
                source("b", SourceStatus::Pending, Some(half)),
                source("c", SourceStatus::Failed, None),
            ],
        );
        let plan = plan_resume(Some(&latest), &names(&["a", "b", "c", "d"]));

        assert_eq!(plan.resumed_from, Some(7));
        assert!(plan.is_carried(&SourceName::new("a")));
        assert_eq!(plan.carried[0].1, Some(done.encode()));
        assert!(!plan.is_carried(&SourceName::new("b")));
        assert_eq!(plan.start_cursor(&SourceName::new("b")).offset, 4);
        assert_eq!(plan.start_cursor(&SourceName::new("c")).offset, 0);
        assert_eq!(plan.start_cursor(&SourceName::new("d")).offset, 0);
    }

    #[test]
    fn test_sources_no_longer_configured_are_dropped() {
        let latest = checkpoint(
            RunStatus::Partial,
            vec![source("gone", SourceStatus::Completed, None)],
        );
        let plan = plan_resume(Some(&latest), &names(&["a"]));
        assert!(plan.carried.is_empty());
        assert_eq!(plan.resumed_from, Some(7));
    }
}
