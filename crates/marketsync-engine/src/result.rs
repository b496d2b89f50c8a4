//! Run and check result types.

use std::time::Duration;

use marketsync_types::drift::DriftReport;
use marketsync_types::state::{RunError, RunStatus, SourceName, SourceStatus};
use serde::Serialize;

/// Outcome of one source within a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceOutcome {
    pub source: SourceName,
    pub status: SourceStatus,
    pub records_processed: u64,
    pub records_failed: u64,
    pub records_skipped: u64,
    /// Fetch attempts made this run (0 for carried sources).
    pub attempts: u32,
    /// Completed by an earlier run and not fetched again.
    pub carried_over: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
}

impl SourceOutcome {
    #[must_use]
    pub fn carried(source: SourceName) -> Self {
        Self {
            source,
            status: SourceStatus::Completed,
            records_processed: 0,
            records_failed: 0,
            records_skipped: 0,
            attempts: 0,
            carried_over: true,
            error: None,
        }
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.status == SourceStatus::Completed
    }
}

/// What the trigger caller gets back from a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: i64,
    pub status: RunStatus,
    pub records_processed: u64,
    pub records_failed: u64,
    pub records_skipped: u64,
    #[serde(serialize_with = "serialize_secs")]
    pub duration: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resumed_from: Option<i64>,
    pub sources: Vec<SourceOutcome>,
    pub drift: DriftReport,
}

impl RunSummary {
    #[must_use]
    pub fn source(&self, name: &SourceName) -> Option<&SourceOutcome> {
        self.sources.iter().find(|s| &s.source == name)
    }

    /// Single-line JSON form for machine consumers.
    #[must_use]
    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!(r#"{{"error":"{e}"}}"#))
    }
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

/// Result of a pipeline check.
#[derive(Debug)]
pub struct CheckResult {
    /// Per-source adapter construction result.
    pub sources: Vec<(SourceName, Result<(), String>)>,
    pub state_ok: bool,
}

impl CheckResult {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.state_ok && self.sources.iter().all(|(_, r)| r.is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_json_line() {
        let summary = RunSummary {
            run_id: 3,
            status: RunStatus::Partial,
            records_processed: 9,
            records_failed: 1,
            records_skipped: 0,
            duration: Duration::from_millis(1500),
            resumed_from: None,
            sources: vec![SourceOutcome::carried(SourceName::new("csv"))],
            drift: DriftReport::new(),
        };
        let line = summary.to_json_line();
        assert!(!line.contains('\n'));
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["status"], "partial");
        assert_eq!(value["duration"], 1.5);
        assert_eq!(value["sources"][0]["carried_over"], true);
        assert!(value.get("resumed_from").is_none());
    }

    #[test]
    fn test_check_result_requires_everything_ok() {
        let mut check = CheckResult {
            sources: vec![(SourceName::new("csv"), Ok(()))],
            state_ok: true,
        };
        assert!(check.is_ok());
        check.sources.push((SourceName::new("api"), Err("bad".into())));
        assert!(!check.is_ok());
    }
}
