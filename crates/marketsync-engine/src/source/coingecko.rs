//! CoinGecko `/coins/markets` adapter.

use std::collections::BTreeSet;

use async_trait::async_trait;
use marketsync_types::error::SourceError;
use marketsync_types::record::RawPayload;
use marketsync_types::state::SourceName;

use super::{field_set, http, SourceAdapter};
use crate::config::types::SourceConfig;
use crate::normalize::FieldMapping;

pub const DEFAULT_BASE_URL: &str = "https://api.coingecko.com/api/v3";
pub const API_KEY_HEADER: &str = "x-cg-demo-api-key";

const KNOWN_FIELDS: &[&str] = &[
    "id",
    "symbol",
    "name",
    "image",
    "current_price",
    "market_cap",
    "market_cap_rank",
    "fully_diluted_valuation",
    "total_volume",
    "high_24h",
    "low_24h",
    "price_change_24h",
    "price_change_percentage_24h",
    "market_cap_change_24h",
    "market_cap_change_percentage_24h",
    "circulating_supply",
    "total_supply",
    "max_supply",
    "ath",
    "ath_change_percentage",
    "ath_date",
    "atl",
    "atl_change_percentage",
    "atl_date",
    "roi",
    "last_updated",
];

pub struct CoingeckoAdapter {
    name: SourceName,
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    limit: Option<usize>,
    incremental: bool,
    mapping: FieldMapping,
}

impl CoingeckoAdapter {
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
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            limit: config.limit,
            incremental: config.incremental,
            mapping: field_mapping(),
        })
    }

    fn request(&self) -> reqwest::RequestBuilder {
        let url = format!("{}/coins/markets", self.base_url.trim_end_matches('/'));
        let mut request = self.client.get(url).query(&[("vs_currency", "usd")]);
        if let Some(limit) = self.limit {
            request = request.query(&[("per_page", limit.to_string())]);
        }
        if let Some(key) = &self.api_key {
            request = request.header(API_KEY_HEADER, key);
        }
        request
    }
}

#[must_use]
pub fn field_mapping() -> FieldMapping {
    FieldMapping::default()
        .with_price(&["current_price"])
        .with_volume(&["total_volume"])
        .with_market_cap(&["market_cap"])
        .with_observed_at(&["last_updated"])
}

#[async_trait]
impl SourceAdapter for CoingeckoAdapter {
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
        let mut payloads = http::fetch_array(self.request()).await?;
        if let Some(limit) = self.limit {
            payloads.truncate(limit);
        }
        tracing::debug!(source = %self.name, count = payloads.len(), "Fetched markets");
        Ok(payloads)
    }
}
