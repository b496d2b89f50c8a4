//! Coinpaprika `/tickers` adapter.

use std::collections::BTreeSet;

use async_trait::async_trait;
use marketsync_types::error::SourceError;
use marketsync_types::record::RawPayload;
use marketsync_types::state::SourceName;

use super::{field_set, http, SourceAdapter};
use crate::config::types::SourceConfig;
use crate::normalize::FieldMapping;

pub const DEFAULT_BASE_URL: &str = "https://api.coinpaprika.com/v1";
pub const DEFAULT_LIMIT: usize = 50;

/// Top-level keys of a ticker object as documented upstream.
const KNOWN_FIELDS: &[&str] = &[
    "id",
    "name",
    "symbol",
    "rank",
    "circulating_supply",
    "total_supply",
    "max_supply",
    "beta_value",
    "first_data_at",
    "last_updated",
    "quotes",
];

pub struct CoinpaprikaAdapter {
    name: SourceName,
    client: reqwest::Client,
    base_url: String,
    limit: usize,
    incremental: bool,
    mapping: FieldMapping,
}

impl CoinpaprikaAdapter {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn from_config(config: &SourceConfig, timeout: std::time::Duration) -> anyhow::Result<Self> {
        Ok(Self {
            name: SourceName::new(&config.name),
            client: http::client(timeout)?,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            limit: config.limit.unwrap_or(DEFAULT_LIMIT),
            incremental: config.incremental,
            mapping: field_mapping(),
        })
    }

    fn url(&self) -> String {
        format!("{}/tickers", self.base_url.trim_end_matches('/'))
    }
}

/// Price and volume live under `quotes.USD`.
#[must_use]
pub fn field_mapping() -> FieldMapping {
    FieldMapping::default()
        .with_price(&["quotes.USD.price"])
        .with_volume(&["quotes.USD.volume_24h"])
        .with_market_cap(&["quotes.USD.market_cap"])
        .with_observed_at(&["last_updated"])
}

#[async_trait]
impl SourceAdapter for CoinpaprikaAdapter {
    fn name(&self) -> &SourceName {
        &self.name
    }

    fn expected_fields(&self) -> BTreeSet<String> {
        field_set(KNOWN_FIELDS)
    }

    fn mapping(&self) -> &FieldMapping {
        &self.mapping
    }

    fn incremental(&self) -> bool {
        self.incremental
    }

    async fn fetch(&self) -> Result<Vec<RawPayload>, SourceError> {
        let mut payloads = http::fetch_array(self.client.get(self.url())).await?;
        payloads.truncate(self.limit);
        tracing::debug!(source = %self.name, count = payloads.len(), "Fetched tickers");
        Ok(payloads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::SourceKind;
    use crate::normalize::normalize;
    use crate::source::http::testing;
    use std::time::Duration;

    fn config(base_url: String, limit: Option<usize>) -> SourceConfig {
        SourceConfig {
            name: "coinpaprika".into(),
            kind: SourceKind::Coinpaprika,
            base_url: Some(base_url),
            api_key: None,
            limit,
            path: None,
            incremental: false,
        }
    }

    fn ticker(symbol: &str, price: f64) -> serde_json::Value {
        serde_json::json!({
            "id": format!("{}-coin", symbol.to_lowercase()),
            "name": symbol,
            "symbol": symbol,
            "rank": 1,
            "last_updated": "2024-05-16T18:24:28Z",
            "quotes": {"USD": {"price": price, "volume_24h": 10.0, "market_cap": 100.0}}
        })
    }

    #[tokio::test]
    async fn test_fetch_truncates_to_limit_and_normalizes() {
        let body = serde_json::Value::Array(vec![
            ticker("BTC", 60_000.0),
            ticker("ETH", 3_000.0),
            ticker("SOL", 150.0),
        ])
        .to_string();
        let base = testing::serve(vec![(200, vec![], body)]).await;
        let adapter = CoinpaprikaAdapter::from_config(&config(base, Some(2)), Duration::from_secs(5)).unwrap();

        let payloads = adapter.fetch().await.unwrap();
        assert_eq!(payloads.len(), 2);

        let obs = normalize(&payloads[1], adapter.mapping(), adapter.name()).unwrap();
        assert_eq!(obs.symbol, "ETH");
        assert_eq!(obs.price, 3_000.0);
        assert_eq!(obs.market_cap, Some(100.0));
    }

    #[test]
    fn test_known_fields_cover_mapping() {
        let adapter = CoinpaprikaAdapter::from_config(
            &config(DEFAULT_BASE_URL.into(), None),
            Duration::from_secs(1),
        )
        .unwrap();
        let expected = adapter.expected_fields();
        for field in adapter.mapping().top_level_fields() {
            assert!(expected.contains(&field), "{field}");
        }
        assert_eq!(adapter.url(), "https://api.coinpaprika.com/v1/tickers");
        assert_eq!(adapter.limit, DEFAULT_LIMIT);
    }
}
