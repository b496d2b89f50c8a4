//! Raw payload to [`Observation`] mapping and validation.
//!
//! The only place where the untyped [`RawPayload`] becomes a typed record.
//! Each payload is validated on its own; a rejection never affects its
//! neighbours in the batch.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SubsecRound, Utc};
use marketsync_types::record::{Observation, RawPayload};
use marketsync_types::state::SourceName;
use serde_json::Value;

/// Epoch values above this are milliseconds, below are seconds.
const EPOCH_MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// Why a payload was rejected.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("field '{field}' has wrong type: expected {expected}, got {found}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
        found: String,
    },
    #[error("field '{0}' is not a finite number")]
    NonFinite(&'static str),
    #[error("field '{field}' must not be negative, got {value}")]
    Negative { field: &'static str, value: f64 },
    #[error("field 'observed_at' is not a valid timestamp: {0}")]
    BadTimestamp(String),
}

/// Source-specific field aliases and unit conversion.
///
/// Each alias is a dotted path into the payload; the first alias holding a
/// non-null value wins.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldMapping {
    pub symbol: Vec<String>,
    pub price: Vec<String>,
    pub volume: Vec<String>,
    pub market_cap: Vec<String>,
    pub observed_at: Vec<String>,
    /// Multiplier applied to `price` (e.g. cents to dollars = 0.01).
    pub price_scale: f64,
}

impl Default for FieldMapping {
    fn default() -> Self {
        Self {
            symbol: paths(&["symbol"]),
            price: paths(&["price"]),
            volume: paths(&["volume"]),
            market_cap: paths(&["market_cap"]),
            observed_at: paths(&["observed_at", "timestamp"]),
            price_scale: 1.0,
        }
    }
}

impl FieldMapping {
    #[must_use]
    pub fn with_symbol(mut self, aliases: &[&str]) -> Self {
        self.symbol = paths(aliases);
        self
    }

    #[must_use]
    pub fn with_price(mut self, aliases: &[&str]) -> Self {
        self.price = paths(aliases);
        self
    }

    #[must_use]
    pub fn with_volume(mut self, aliases: &[&str]) -> Self {
        self.volume = paths(aliases);
        self
    }

    #[must_use]
    pub fn with_market_cap(mut self, aliases: &[&str]) -> Self {
        self.market_cap = paths(aliases);
        self
    }

    #[must_use]
    pub fn with_observed_at(mut self, aliases: &[&str]) -> Self {
        self.observed_at = paths(aliases);
        self
    }

    #[must_use]
    pub fn with_price_scale(mut self, scale: f64) -> Self {
        self.price_scale = scale;
        self
    }

    /// Top-level payload keys this mapping reads.
    #[must_use]
    pub fn top_level_fields(&self) -> BTreeSet<String> {
        [
            &self.symbol,
            &self.price,
            &self.volume,
            &self.market_cap,
            &self.observed_at,
        ]
        .into_iter()
        .flatten()
        .filter_map(|path| path.split('.').next())
        .map(str::to_string)
        .collect()
    }
}

fn paths(aliases: &[&str]) -> Vec<String> {
    aliases.iter().map(|a| (*a).to_string()).collect()
}

/// Map one payload into an [`Observation`].
///
/// # Errors
///
/// Returns [`ValidationError`] for a missing or blank symbol, a missing
/// price or timestamp, a wrong type, a non-finite number, or a negative
/// price, volume, or market cap.
pub fn normalize(
    payload: &RawPayload,
    mapping: &FieldMapping,
    source: &SourceName,
) -> Result<Observation, ValidationError> {
    let symbol = match lookup(payload, &mapping.symbol) {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_uppercase(),
        Some(Value::String(_)) | None => return Err(ValidationError::MissingField("symbol")),
        Some(other) => return Err(wrong_type("symbol", "string", other)),
    };

    let price = lookup(payload, &mapping.price)
        .ok_or(ValidationError::MissingField("price"))
        .and_then(|v| non_negative("price", v))?
        * mapping.price_scale;
    if !price.is_finite() {
        return Err(ValidationError::NonFinite("price"));
    }

    let volume = lookup(payload, &mapping.volume)
        .map(|v| non_negative("volume", v))
        .transpose()?;
    let market_cap = lookup(payload, &mapping.market_cap)
        .map(|v| non_negative("market_cap", v))
        .transpose()?;

    let observed_at = lookup(payload, &mapping.observed_at)
        .ok_or(ValidationError::MissingField("observed_at"))
        .and_then(parse_timestamp)?;

    Ok(Observation {
        symbol,
        price,
        volume,
        market_cap,
        source_name: source.clone(),
        observed_at,
    })
}

fn lookup<'a>(payload: &'a RawPayload, aliases: &[String]) -> Option<&'a Value> {
    aliases
        .iter()
        .filter_map(|path| payload.get_path(path))
        .find(|v| !v.is_null())
}

fn wrong_type(field: &'static str, expected: &'static str, found: &Value) -> ValidationError {
    let found = match found {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    };
    ValidationError::WrongType {
        field,
        expected,
        found: found.to_string(),
    }
}

fn number(field: &'static str, value: &Value) -> Result<f64, ValidationError> {
    let n = match value {
        Value::Number(n) => n.as_f64().ok_or(ValidationError::NonFinite(field))?,
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| wrong_type(field, "number", value))?,
        other => return Err(wrong_type(field, "number", other)),
    };
    if n.is_finite() {
        Ok(n)
    } else {
        Err(ValidationError::NonFinite(field))
    }
}

fn non_negative(field: &'static str, value: &Value) -> Result<f64, ValidationError> {
    let n = number(field, value)?;
    if n < 0.0 {
        return Err(ValidationError::Negative { field, value: n });
    }
    Ok(n)
}

/// Accepts RFC 3339, naive ISO 8601 (UTC), a bare date, or epoch
/// seconds/milliseconds. Truncated to microseconds, the storage precision.
fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>, ValidationError> {
    let parsed = match value {
        Value::Number(n) => n.as_i64().and_then(from_epoch),
        Value::String(s) => parse_timestamp_str(s.trim()),
        _ => None,
    };
    parsed
        .map(|ts| ts.trunc_subsecs(6))
        .ok_or_else(|| ValidationError::BadTimestamp(value.to_string()))
}

fn parse_timestamp_str(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
    }
    raw.parse::<i64>().ok().and_then(from_epoch)
}

fn from_epoch(value: i64) -> Option<DateTime<Utc>> {
    if value.abs() >= EPOCH_MILLIS_THRESHOLD {
        DateTime::from_timestamp_millis(value)
    } else {
        DateTime::from_timestamp(value, 0)
    }
}
