//! Schema drift detection on raw payloads.
//!
//! Advisory only: an unexpected key is logged, counted, and summarized in
//! the run's [`DriftReport`], and the payload continues to the normalizer.
//! Missing expected keys are the normalizer's business.

use std::collections::BTreeSet;

use marketsync_types::drift::DriftReport;
use marketsync_types::record::RawPayload;
use marketsync_types::state::SourceName;

use crate::metrics;

/// Keys of `payload` not in `expected`, each with a rendered sample value.
#[must_use]
pub fn unexpected_fields(payload: &RawPayload, expected: &BTreeSet<String>) -> Vec<(String, String)> {
    payload
        .keys()
        .filter(|key| !expected.contains(*key))
        .map(|key| {
            let sample = payload
                .get(key)
                .map_or_else(|| "null".to_string(), ToString::to_string);
            (key.to_string(), sample)
        })
        .collect()
}

/// Per-source, per-run drift detector.
pub struct DriftDetector {
    source: SourceName,
    run_id: i64,
    expected: BTreeSet<String>,
    report: DriftReport,
}

impl DriftDetector {
    #[must_use]
    pub fn new(source: SourceName, run_id: i64, expected: BTreeSet<String>) -> Self {
        Self {
            source,
            run_id,
            expected,
            report: DriftReport::new(),
        }
    }

    /// Inspect one payload and return its unexpected keys. Never fails.
    pub fn inspect(&mut self, payload: &RawPayload) -> Vec<String> {
        let unexpected = unexpected_fields(payload, &self.expected);
        if unexpected.is_empty() {
            return Vec::new();
        }

        let keys: Vec<String> = unexpected.iter().map(|(k, _)| k.clone()).collect();
        let samples: Vec<String> = unexpected
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        tracing::warn!(
            source = %self.source,
            run_id = self.run_id,
            unexpected_keys = ?keys,
            sample_values = ?samples,
            "Drift detected"
        );
        metrics::drift_fields(&self.source, keys.len());
        self.report.record(&self.source, &unexpected);
        keys
    }

    #[must_use]
    pub fn report(&self) -> &DriftReport {
        &self.report
    }

    #[must_use]
    pub fn into_report(self) -> DriftReport {
        self.report
    }
}
