//! Raw upstream payloads and the unified market record.
//!
//! [`RawPayload`] is the untyped boundary form of one upstream item. Only
//! the normalizer turns it into an [`Observation`]; the writer stamps an
//! observation with its ingestion time to produce a [`UnifiedRecord`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::state::SourceName;

/// One upstream item as an untyped key/value mapping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawPayload(Map<String, Value>);

impl RawPayload {
    #[must_use]
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Top-level keys in payload order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Resolve a dotted path (`quotes.USD.price`) through nested objects.
    #[must_use]
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.0.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn to_json(&self) -> String {
        Value::Object(self.0.clone()).to_string()
    }
}

impl From<Map<String, Value>> for RawPayload {
    fn from(value: Map<String, Value>) -> Self {
        Self(value)
    }
}

impl TryFrom<Value> for RawPayload {
    type Error = Value;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(other),
        }
    }
}

/// Natural key of a unified record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub symbol: String,
    pub observed_at: DateTime<Utc>,
}

/// A validated market observation, not yet written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub symbol: String,
    pub price: f64,
    pub volume: Option<f64>,
    pub market_cap: Option<f64>,
    pub source_name: SourceName,
    pub observed_at: DateTime<Utc>,
}

impl Observation {
    #[must_use]
    pub fn key(&self) -> RecordKey {
        RecordKey {
            symbol: self.symbol.clone(),
            observed_at: self.observed_at,
        }
    }
}

/// One normalized market observation as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedRecord {
    pub symbol: String,
    pub price: f64,
    pub volume: Option<f64>,
    pub market_cap: Option<f64>,
    pub source_name: SourceName,
    pub observed_at: DateTime<Utc>,
    pub ingested_at: DateTime<Utc>,
}

impl UnifiedRecord {
    /// Stamp an observation with the time it is being written.
    #[must_use]
    pub fn from_observation(observation: Observation, ingested_at: DateTime<Utc>) -> Self {
        Self {
            symbol: observation.symbol,
            price: observation.price,
            volume: observation.volume,
            market_cap: observation.market_cap,
            source_name: observation.source_name,
            observed_at: observation.observed_at,
            ingested_at,
        }
    }

    #[must_use]
    pub fn key(&self) -> RecordKey {
        RecordKey {
            symbol: self.symbol.clone(),
            observed_at: self.observed_at,
        }
    }

    /// Compare everything except `ingested_at`.
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        self.symbol == other.symbol
            && self.price == other.price
            && self.volume == other.volume
            && self.market_cap == other.market_cap
            && self.source_name == other.source_name
            && self.observed_at == other.observed_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn payload(value: Value) -> RawPayload {
        RawPayload::try_from(value).unwrap()
    }

    #[test]
    fn get_path_walks_nested_objects() {
        let p = payload(json!({"symbol": "btc", "quotes": {"USD": {"price": 42.5}}}));
        assert_eq!(p.get_path("quotes.USD.price"), Some(&json!(42.5)));
        assert_eq!(p.get_path("symbol"), Some(&json!("btc")));
        assert!(p.get_path("quotes.EUR.price").is_none());
        assert!(p.get_path("symbol.inner").is_none());
    }

    #[test]
    fn non_object_is_rejected() {
        assert!(RawPayload::try_from(json!([1, 2])).is_err());
    }

    #[test]
    fn from_observation_keeps_key() {
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let obs = Observation {
            symbol: "BTC".into(),
            price: 100.0,
            volume: None,
            market_cap: Some(1.0e12),
            source_name: SourceName::new("coingecko"),
            observed_at: at,
        };
        let key = obs.key();
        let rec = UnifiedRecord::from_observation(obs, Utc::now());
        assert_eq!(rec.key(), key);
        assert_eq!(rec.market_cap, Some(1.0e12));
    }

    #[test]
    fn same_content_ignores_ingested_at() {
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let a = UnifiedRecord {
            symbol: "ETH".into(),
            price: 3.0,
            volume: Some(1.0),
            market_cap: None,
            source_name: SourceName::new("csv"),
            observed_at: at,
            ingested_at: at,
        };
        let mut b = a.clone();
        b.ingested_at = Utc::now();
        assert!(a.same_content(&b));
        b.price = 4.0;
        assert!(!a.same_content(&b));
    }
}
