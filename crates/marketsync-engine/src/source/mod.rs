//! Source adapters: stateless fetchers of raw upstream payloads.
//!
//! An adapter knows how to reach one upstream and which fields that
//! upstream is expected to send. It carries no business logic: retry,
//! drift detection, normalization and persistence all happen in the
//! orchestrator around [`SourceAdapter::fetch`].

pub mod coingecko;
pub mod coinpaprika;
pub mod csv_file;
pub(crate) mod http;

use std::collections::BTreeSet;

use async_trait::async_trait;
use marketsync_types::error::SourceError;
use marketsync_types::record::RawPayload;
use marketsync_types::state::SourceName;

use crate::normalize::FieldMapping;

pub use coingecko::CoingeckoAdapter;
pub use coinpaprika::CoinpaprikaAdapter;
pub use csv_file::CsvFileAdapter;

/// One upstream origin of market records.
///
/// Implementations must be cheap to call repeatedly: the retry controller
/// may invoke [`fetch`](SourceAdapter::fetch) several times per run.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Unique name within the pipeline; used as checkpoint and metric key.
    fn name(&self) -> &SourceName;

    /// Known top-level payload keys. Anything else is reported as drift.
    fn expected_fields(&self) -> BTreeSet<String> {
        self.mapping().top_level_fields()
    }

    /// Field aliases and unit conversion for the normalizer.
    fn mapping(&self) -> &FieldMapping;

    /// Whether two fetches return the same payloads in the same order, so a
    /// resumed run may skip an already-committed prefix.
    fn replayable(&self) -> bool {
        false
    }

    /// Whether records at or below the source's watermark are skipped.
    fn incremental(&self) -> bool {
        false
    }

    /// Fetch the current window of raw payloads.
    async fn fetch(&self) -> Result<Vec<RawPayload>, SourceError>;
}

pub(crate) fn field_set(fields: &[&str]) -> BTreeSet<String> {
    fields.iter().map(|f| (*f).to_string()).collect()
}
