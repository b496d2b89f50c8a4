//! Adapter construction and state backend creation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use marketsync_state::{SqliteStateBackend, StateBackend};

use crate::config::types::{PipelineConfig, SourceConfig, SourceKind, StateBackendKind};
use crate::source::{CoingeckoAdapter, CoinpaprikaAdapter, CsvFileAdapter, SourceAdapter};

/// Location of the state DB when the pipeline does not name one.
#[must_use]
pub fn default_state_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".marketsync").join("state.db")
}

/// Open the configured state backend.
///
/// # Errors
///
/// Returns an error if the database cannot be opened or migrated.
pub fn create_state_backend(config: &PipelineConfig) -> Result<Arc<dyn StateBackend>> {
    match config.state.backend {
        StateBackendKind::Sqlite => {
            let backend = if let Some(path) = &config.state.connection {
                SqliteStateBackend::open(Path::new(path)).context("Failed to open state DB")?
            } else {
                SqliteStateBackend::open(&default_state_path())
                    .context("Failed to open default state DB")?
            };
            Ok(Arc::new(backend) as Arc<dyn StateBackend>)
        }
    }
}

pub(crate) fn check_state_backend(config: &PipelineConfig) -> bool {
    match create_state_backend(config) {
        Ok(_) => {
            tracing::info!("State backend: OK");
            true
        }
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "State backend: FAILED");
            false
        }
    }
}

/// Build the adapter for one configured source.
///
/// # Errors
///
/// Returns an error if the adapter's HTTP client cannot be built.
pub fn build_adapter(
    source: &SourceConfig,
    config: &PipelineConfig,
) -> Result<Arc<dyn SourceAdapter>> {
    let timeout = config.resources.request_timeout();
    let adapter: Arc<dyn SourceAdapter> = match source.kind {
        SourceKind::Coinpaprika => Arc::new(
            CoinpaprikaAdapter::from_config(source, timeout)
                .with_context(|| format!("Failed to build source '{}'", source.name))?,
        ),
        SourceKind::Coingecko => Arc::new(
            CoingeckoAdapter::from_config(source, timeout)
                .with_context(|| format!("Failed to build source '{}'", source.name))?,
        ),
        SourceKind::Csv => Arc::new(CsvFileAdapter::from_config(source)),
    };
    tracing::debug!(source = source.name, kind = ?source.kind, "Built source adapter");
    Ok(adapter)
}

/// Build adapters for every configured source, in configuration order.
///
/// # Errors
///
/// Returns the first adapter construction error.
pub fn build_adapters(config: &PipelineConfig) -> Result<Vec<Arc<dyn SourceAdapter>>> {
    config
        .sources
        .iter()
        .map(|source| build_adapter(source, config))
        .collect()
}
