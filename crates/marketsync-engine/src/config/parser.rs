//! Pipeline YAML parsing with environment variable substitution and
//! environment overrides.

use std::path::Path;
use std::str::FromStr;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;

use crate::config::types::PipelineConfig;

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var regex"));

/// Substitute `${VAR_NAME}` patterns with environment variable values.
///
/// # Errors
///
/// Returns an error naming every referenced variable that is not set.
pub fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();
    let mut errors = Vec::new();

    for cap in ENV_VAR_RE.captures_iter(input) {
        let var_name = &cap[1];
        match std::env::var(var_name) {
            Ok(val) => {
                result = result.replace(&cap[0], &val);
            }
            Err(_) => {
                if !errors.iter().any(|e| e == var_name) {
                    errors.push(var_name.to_string());
                }
            }
        }
    }

    if !errors.is_empty() {
        anyhow::bail!("Missing environment variable(s): {}", errors.join(", "));
    }

    Ok(result)
}

/// Parse a pipeline YAML string (after env var substitution).
///
/// # Errors
///
/// Returns an error if env var substitution fails or the YAML is invalid.
pub fn parse_pipeline_str(yaml_str: &str) -> Result<PipelineConfig> {
    let substituted = substitute_env_vars(yaml_str)?;
    let config: PipelineConfig =
        serde_yaml::from_str(&substituted).context("Failed to parse pipeline YAML")?;
    Ok(config)
}

/// Parse a pipeline YAML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the YAML is invalid.
pub fn parse_pipeline(path: &Path) -> Result<PipelineConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;
    parse_pipeline_str(&content)
}

/// Parse a pipeline file and apply overrides from the process environment.
///
/// # Errors
///
/// Returns an error if parsing fails or an override value is malformed.
pub fn load_pipeline(path: &Path) -> Result<PipelineConfig> {
    let mut config = parse_pipeline(path)?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    Ok(config)
}

/// Environment variable prefix for a source name: upper-cased, `-` to `_`.
#[must_use]
pub fn source_env_prefix(source_name: &str) -> String {
    source_name.to_ascii_uppercase().replace('-', "_")
}

/// Apply `CHAOS_MODE`, `RETRY_MAX_ATTEMPTS`, `RETRY_BASE_DELAY_MS`,
/// `CONCURRENCY_LIMIT`, `<SOURCE>_BASE_URL`, and `<SOURCE>_API_KEY`.
///
/// `lookup` resolves a variable name; every malformed value is reported in
/// a single error.
///
/// # Errors
///
/// Returns an error listing each override that could not be parsed.
pub fn apply_env_overrides<F>(config: &mut PipelineConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let mut errors = Vec::new();

    if let Some(raw) = lookup("CHAOS_MODE") {
        match parse_bool(&raw) {
            Some(enabled) => config.chaos.enabled = enabled,
            None => errors.push(format!("CHAOS_MODE: expected a boolean, got '{raw}'")),
        }
    }
    override_number(&lookup, "RETRY_MAX_ATTEMPTS", &mut config.resources.max_attempts, &mut errors);
    override_number(&lookup, "RETRY_BASE_DELAY_MS", &mut config.resources.base_delay_ms, &mut errors);
    override_number(&lookup, "CONCURRENCY_LIMIT", &mut config.resources.concurrency, &mut errors);

    for source in &mut config.sources {
        let prefix = source_env_prefix(&source.name);
        if let Some(url) = lookup(&format!("{prefix}_BASE_URL")) {
            source.base_url = Some(url);
        }
        if let Some(key) = lookup(&format!("{prefix}_API_KEY")) {
            source.api_key = Some(key);
        }
    }

    if !errors.is_empty() {
        anyhow::bail!("Invalid environment override(s):\n  - {}", errors.join("\n  - "));
    }
    Ok(())
}

fn override_number<F, T>(lookup: &F, key: &str, target: &mut T, errors: &mut Vec<String>)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        match raw.trim().parse::<T>() {
            Ok(value) => *target = value,
            Err(_) => errors.push(format!("{key}: expected a non-negative integer, got '{raw}'")),
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}
