//! Per-run schema drift summary.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::state::SourceName;

/// Longest sample value kept per unexpected key.
pub const MAX_SAMPLE_LEN: usize = 120;

/// Unexpected keys seen for one source during a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDrift {
    /// Unexpected key -> number of payloads it appeared in.
    pub unexpected: BTreeMap<String, u64>,
    /// Unexpected key -> first value observed (JSON, truncated).
    pub samples: BTreeMap<String, String>,
    /// Payloads that carried at least one unexpected key.
    pub payloads_with_drift: u64,
}

/// Drift observed across all sources of one run. Not persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftReport {
    pub sources: BTreeMap<SourceName, SourceDrift>,
}

impl DriftReport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the unexpected keys of a single payload.
    ///
    /// `unexpected` pairs each key with a rendered sample value. Calls with
    /// no keys leave the report untouched.
    pub fn record(&mut self, source: &SourceName, unexpected: &[(String, String)]) {
        if unexpected.is_empty() {
            return;
        }
        let entry = self.sources.entry(source.clone()).or_default();
        entry.payloads_with_drift += 1;
        for (key, sample) in unexpected {
            *entry.unexpected.entry(key.clone()).or_insert(0) += 1;
            entry
                .samples
                .entry(key.clone())
                .or_insert_with(|| truncate_sample(sample));
        }
    }

    /// Fold another report (e.g. from a concurrent source task) into this one.
    pub fn merge(&mut self, other: DriftReport) {
        for (source, drift) in other.sources {
            let entry = self.sources.entry(source).or_default();
            entry.payloads_with_drift += drift.payloads_with_drift;
            for (key, count) in drift.unexpected {
                *entry.unexpected.entry(key).or_insert(0) += count;
            }
            for (key, sample) in drift.samples {
                entry.samples.entry(key).or_insert(sample);
            }
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Unexpected keys seen for `source`, sorted.
    #[must_use]
    pub fn unexpected_keys(&self, source: &SourceName) -> Vec<&str> {
        self.sources
            .get(source)
            .map(|d| d.unexpected.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }
}

fn truncate_sample(sample: &str) -> String {
    if sample.len() <= MAX_SAMPLE_LEN {
        return sample.to_string();
    }
    let mut end = MAX_SAMPLE_LEN;
    while !sample.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &sample[..end])
}
