//! Local CSV import adapter.
//!
//! Expects a header row with at least `symbol,price,date`; `volume` and
//! `market_cap` columns are optional. Every row becomes a payload of
//! strings and empty cells become nulls. Rows come back in file order, so
//! the adapter is replayable.

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use marketsync_types::error::SourceError;
use marketsync_types::record::RawPayload;
use marketsync_types::state::SourceName;
use serde_json::{Map, Value};

use super::{field_set, SourceAdapter};
use crate::config::types::SourceConfig;
use crate::normalize::FieldMapping;

const KNOWN_FIELDS: &[&str] = &["symbol", "price", "date", "volume", "market_cap"];

pub struct CsvFileAdapter {
    name: SourceName,
    path: PathBuf,
    incremental: bool,
    mapping: FieldMapping,
}

impl CsvFileAdapter {
    #[must_use]
    pub fn new(name: impl Into<SourceName>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            incremental: false,
            mapping: field_mapping(),
        }
    }

    #[must_use]
    pub fn from_config(config: &SourceConfig) -> Self {
        let mut adapter = Self::new(config.name.as_str(), config.path.clone().unwrap_or_default());
        adapter.incremental = config.incremental;
        adapter
    }

    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[must_use]
pub fn field_mapping() -> FieldMapping {
    FieldMapping::default()
        .with_volume(&["volume"])
        .with_observed_at(&["date"])
}

/// Read every row of `path` as a payload. Blocking.
pub(crate) fn read_rows(path: &std::path::Path) -> Result<Vec<RawPayload>, SourceError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| csv_error(path, &e))?;

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| csv_error(path, &e))?
        .iter()
        .map(str::to_lowercase)
        .collect();

    let mut payloads = Vec::new();
    for row in reader.records() {
        let row = row.map_err(|e| csv_error(path, &e))?;
        let fields: Map<String, Value> = headers
            .iter()
            .zip(row.iter())
            .map(|(header, cell)| {
                let value = if cell.is_empty() {
                    Value::Null
                } else {
                    Value::String(cell.to_string())
                };
                (header.clone(), value)
            })
            .collect();
        payloads.push(RawPayload::new(fields));
    }
    Ok(payloads)
}

fn csv_error(path: &std::path::Path, err: &csv::Error) -> SourceError {
    let display = path.display();
    match err.kind() {
        csv::ErrorKind::Io(io) if io.kind() == ErrorKind::NotFound => {
            SourceError::io("FILE_NOT_FOUND", format!("CSV file not found: {display}"))
        }
        csv::ErrorKind::Io(io) => {
            SourceError::io("READ_FAILED", format!("Failed to read {display}: {io}"))
        }
        _ => SourceError::malformed("INVALID_CSV", format!("Invalid CSV in {display}: {err}")),
    }
}

#[async_trait]
impl SourceAdapter for CsvFileAdapter {
    fn name(&self) -> &SourceName {
        &self.name
    }

    fn expected_fields(&self) -> BTreeSet<String> {
        field_set(KNOWN_FIELDS)
    }

    fn mapping(&self) -> &FieldMapping {
        &self.mapping
    }

    fn replayable(&self) -> bool {
        true
    }

    fn incremental(&self) -> bool {
        self.incremental
    }

    async fn fetch(&self) -> Result<Vec<RawPayload>, SourceError> {
        let path = self.path.clone();
        let payloads = tokio::task::spawn_blocking(move || read_rows(&path))
            .await
            .map_err(|e| SourceError::io("READ_TASK", format!("CSV read task failed: {e}")))??;
        tracing::debug!(
            source = %self.name,
            path = %self.path.display(),
            count = payloads.len(),
            "Read CSV rows"
        );
        Ok(payloads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marketsync_types::error::ErrorCategory;
    use std::io::Write;

    fn write_csv(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn test_rows_become_string_payloads() {
        let file = write_csv("Symbol,price,date\nbtc, 42000.5 ,2024-01-15\neth,,2024-01-15\n");
        let adapter = CsvFileAdapter::new("csv_upload", file.path());

        let payloads = adapter.fetch().await.unwrap();
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[0].get("symbol").unwrap(), "btc");
        assert_eq!(payloads[0].get("price").unwrap(), "42000.5");
        assert!(payloads[1].get("price").unwrap().is_null());
        assert!(adapter.replayable());
    }

    #[tokio::test]
    async fn test_missing_file_is_permanent_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = CsvFileAdapter::new("csv_upload", dir.path().join("absent.csv"));
        let err = adapter.fetch().await.unwrap_err();
        assert_eq!(err.category, ErrorCategory::Io);
        assert_eq!(err.code, "FILE_NOT_FOUND");
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn test_short_rows_are_tolerated() {
        let file = write_csv("symbol,price,date,volume\nsol,150,2024-01-15\n");
        let adapter = CsvFileAdapter::new("csv_upload", file.path());
        let payloads = adapter.fetch().await.unwrap();
        assert_eq!(payloads[0].len(), 3);
        let obs = crate::normalize::normalize(&payloads[0], adapter.mapping(), adapter.name()).unwrap();
        assert_eq!(obs.symbol, "SOL");
        assert_eq!(obs.volume, None);
    }

    #[tokio::test]
    async fn test_sample_fixture_loads() {
        let fixture = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .parent()
            .and_then(|p| p.parent())
            .unwrap()
            .join("tests/fixtures/data/crypto_sample.csv");
        let adapter = CsvFileAdapter::new("csv_upload", fixture);
        let payloads = adapter.fetch().await.unwrap();
        assert_eq!(payloads.len(), 10);
        for payload in &payloads {
            assert!(crate::drift::unexpected_fields(payload, &adapter.expected_fields()).is_empty());
        }
    }
}
