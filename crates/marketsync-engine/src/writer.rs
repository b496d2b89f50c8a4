//! Idempotent upserts of normalized records.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use marketsync_state::{StateBackend, UpsertSummary};
use marketsync_types::record::{Observation, UnifiedRecord};
use marketsync_types::state::SourceName;

use crate::checkpoint::state_call;
use crate::errors::PipelineError;

/// Source of `ingested_at` stamps.
///
/// Stamps are strictly increasing at microsecond (storage) precision, so
/// among writes of the same key the later write is always "newer" and wins.
#[derive(Debug)]
pub struct IngestClock {
    last: Mutex<Option<DateTime<Utc>>>,
}

impl IngestClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            last: Mutex::new(None),
        }
    }

    pub fn tick(&self) -> DateTime<Utc> {
        let now = Utc::now().trunc_subsecs(6);
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let next = match *last {
            Some(prev) if now <= prev => prev + TimeDelta::microseconds(1),
            _ => now,
        };
        *last = Some(next);
        next
    }
}

impl Default for IngestClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes batches of observations under their natural key.
#[derive(Clone)]
pub struct UpsertWriter {
    state: Arc<dyn StateBackend>,
    clock: Arc<IngestClock>,
}

impl UpsertWriter {
    #[must_use]
    pub fn new(state: Arc<dyn StateBackend>, clock: Arc<IngestClock>) -> Self {
        Self { state, clock }
    }

    /// Stamp observations in order; the last one gets the newest stamp.
    #[must_use]
    pub fn stamp(&self, observations: Vec<Observation>) -> Vec<UnifiedRecord> {
        observations
            .into_iter()
            .map(|obs| UnifiedRecord::from_observation(obs, self.clock.tick()))
            .collect()
    }

    /// Stamp and upsert one batch in a single transaction.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::State`] if the store rejects the batch; no
    /// record of the batch is written in that case.
    pub async fn write(
        &self,
        source: &SourceName,
        observations: Vec<Observation>,
    ) -> Result<UpsertSummary, PipelineError> {
        if observations.is_empty() {
            return Ok(UpsertSummary::default());
        }
        let records = self.stamp(observations);
        let summary =
            state_call("upsert_batch", &self.state, move |s| s.upsert_batch(&records)).await?;
        tracing::debug!(
            source = %source,
            inserted = summary.inserted,
            updated = summary.updated,
            unchanged = summary.unchanged,
            "Batch upserted"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use marketsync_state::SqliteStateBackend;

    fn obs(symbol: &str, price: f64, source: &str) -> Observation {
        Observation {
            symbol: symbol.into(),
            price,
            volume: None,
            market_cap: None,
            source_name: SourceName::new(source),
            observed_at: Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap(),
        }
    }

    fn writer() -> (UpsertWriter, Arc<dyn StateBackend>) {
        let state: Arc<dyn StateBackend> = Arc::new(SqliteStateBackend::in_memory().unwrap());
        (
            UpsertWriter::new(state.clone(), Arc::new(IngestClock::new())),
            state,
        )
    }

    #[test]
    fn test_clock_is_strictly_increasing() {
        let clock = IngestClock::new();
        let stamps: Vec<_> = (0..1_000).map(|_| clock.tick()).collect();
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));
        assert!(stamps.iter().all(|s| s.timestamp_subsec_nanos() % 1_000 == 0));
    }

    #[tokio::test]
    async fn test_same_batch_twice_is_idempotent() {
        let (writer, state) = writer();
        let src = SourceName::new("csv");
        let batch = vec![obs("BTC", 1.0, "csv"), obs("ETH", 2.0, "csv")];

        let first = writer.write(&src, batch.clone()).await.unwrap();
        assert_eq!(first.inserted, 2);
        let second = writer.write(&src, batch).await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(state.count_records().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_last_writer_wins_on_same_key() {
        let (writer, state) = writer();
        writer
            .write(&SourceName::new("coingecko"), vec![obs("BTC", 100.0, "coingecko")])
            .await
            .unwrap();
        writer
            .write(&SourceName::new("coinpaprika"), vec![obs("BTC", 101.0, "coinpaprika")])
            .await
            .unwrap();

        let stored = state.list_records().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].price, 101.0);
        assert_eq!(stored[0].source_name, SourceName::new("coinpaprika"));
    }

    #[tokio::test]
    async fn test_empty_batch_touches_nothing() {
        let (writer, state) = writer();
        let summary = writer.write(&SourceName::new("csv"), vec![]).await.unwrap();
        assert_eq!(summary.written(), 0);
        assert_eq!(state.count_records().unwrap(), 0);
    }
}
