//! Pipeline configuration model deserialized from YAML.

use std::time::Duration;

use serde::Deserialize;

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BASE_DELAY_MS: u64 = 500;
const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
const DEFAULT_CONCURRENCY: usize = 2;
const DEFAULT_BATCH_SIZE: usize = 100;
const DEFAULT_LEASE_TTL_SECS: u64 = 300;
const DEFAULT_CHAOS_AFTER_RECORDS: u64 = 3;
const DEFAULT_CHAOS_PROBABILITY: f64 = 0.05;

/// Top-level pipeline file.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub version: String,
    pub pipeline: String,
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub resources: ResourceConfig,
    #[serde(default)]
    pub chaos: ChaosConfig,
}

/// Which upstream adapter serves a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Coinpaprika,
    Coingecko,
    Csv,
}

impl SourceKind {
    #[must_use]
    pub fn is_http(self) -> bool {
        matches!(self, Self::Coinpaprika | Self::Coingecko)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub kind: SourceKind,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Keep only the first `limit` upstream entries.
    #[serde(default)]
    pub limit: Option<usize>,
    /// Local file, for `csv` sources.
    #[serde(default)]
    pub path: Option<String>,
    /// Skip records not newer than the source's high-watermark.
    #[serde(default)]
    pub incremental: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateBackendKind {
    #[default]
    Sqlite,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StateConfig {
    #[serde(default)]
    pub backend: StateBackendKind,
    /// Database path; defaults to `~/.marketsync/state.db`.
    #[serde(default)]
    pub connection: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub concurrency: usize,
    pub batch_size: usize,
    pub lease_ttl_secs: u64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            concurrency: DEFAULT_CONCURRENCY,
            batch_size: DEFAULT_BATCH_SIZE,
            lease_ttl_secs: DEFAULT_LEASE_TTL_SECS,
        }
    }
}

impl ResourceConfig {
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    #[must_use]
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChaosStrategyKind {
    /// Abort once a source passes half of its fetched records.
    #[default]
    Midpoint,
    /// Abort once a source passes `after_records` records.
    AfterRecords,
    /// Abort each batch with probability `probability`.
    Random,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChaosConfig {
    pub enabled: bool,
    pub strategy: ChaosStrategyKind,
    pub after_records: u64,
    pub probability: f64,
    pub seed: Option<u64>,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            strategy: ChaosStrategyKind::default(),
            after_records: DEFAULT_CHAOS_AFTER_RECORDS,
            probability: DEFAULT_CHAOS_PROBABILITY,
            seed: None,
        }
    }
}
