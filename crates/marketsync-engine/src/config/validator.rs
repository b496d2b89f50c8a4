//! Semantic validation for parsed pipeline configuration values.

use std::collections::HashSet;

use anyhow::{bail, Result};

use crate::config::types::{ChaosStrategyKind, PipelineConfig, SourceConfig, SourceKind};
use crate::retry::RetryPolicy;

fn validate_source(index: usize, source: &SourceConfig, errors: &mut Vec<String>) {
    let label = if source.name.trim().is_empty() {
        errors.push(format!("Source {index} has an empty name"));
        format!("sources[{index}]")
    } else {
        format!("Source '{}'", source.name)
    };

    match source.kind {
        SourceKind::Coinpaprika | SourceKind::Coingecko => {
            if source.base_url.as_deref().map_or(true, |u| u.trim().is_empty()) {
                errors.push(format!("{label} requires base_url"));
            }
        }
        SourceKind::Csv => {
            if source.path.as_deref().map_or(true, |p| p.trim().is_empty()) {
                errors.push(format!("{label} requires path"));
            }
        }
    }

    if source.limit == Some(0) {
        errors.push(format!("{label}: limit must be at least 1"));
    }
}

/// Validate a parsed pipeline configuration.
/// Returns `Ok(())` if valid, Err with all validation errors if not.
///
/// # Errors
///
/// Returns an error listing all validation failures found in the pipeline config.
pub fn validate_pipeline(config: &PipelineConfig) -> Result<()> {
    let mut errors = Vec::new();

    if config.version != "1.0" {
        errors.push(format!(
            "Unsupported pipeline version '{}', expected '1.0'",
            config.version
        ));
    }

    if config.pipeline.trim().is_empty() {
        errors.push("Pipeline name must not be empty".to_string());
    }

    if config.sources.is_empty() {
        errors.push("Pipeline must define at least one source".to_string());
    }

    let mut seen = HashSet::new();
    for (i, source) in config.sources.iter().enumerate() {
        validate_source(i, source, &mut errors);
        if !source.name.trim().is_empty() && !seen.insert(source.name.as_str()) {
            errors.push(format!("Duplicate source name '{}'", source.name));
        }
    }

    let resources = &config.resources;
    if resources.max_attempts == 0 {
        errors.push("max_attempts must be at least 1".to_string());
    }
    if resources.concurrency == 0 {
        errors.push("concurrency must be at least 1".to_string());
    }
    if resources.batch_size == 0 {
        errors.push("batch_size must be at least 1".to_string());
    }
    if resources.request_timeout_secs == 0 {
        errors.push("request_timeout_secs must be > 0".to_string());
    }
    if resources.max_delay_ms < resources.base_delay_ms {
        errors.push("max_delay_ms must not be smaller than base_delay_ms".to_string());
    }

    let window = RetryPolicy::from_resources(resources).worst_case_window();
    if resources.lease_ttl() < window {
        let window_secs = window.as_secs() + u64::from(window.subsec_nanos() > 0);
        errors.push(format!(
            "lease_ttl_secs ({}) must cover the worst-case retry window of {window_secs}s",
            resources.lease_ttl_secs
        ));
    }

    if config.chaos.strategy == ChaosStrategyKind::Random
        && !(config.chaos.probability > 0.0 && config.chaos.probability <= 1.0)
    {
        errors.push(format!(
            "chaos probability must be in (0, 1], got {}",
            config.chaos.probability
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        bail!("Pipeline validation failed:\n  - {}", errors.join("\n  - "));
    }
}
