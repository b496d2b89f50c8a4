//! Shared HTTP plumbing for the REST adapters.
//!
//! Maps every transport and status failure onto a [`SourceError`] so the
//! retry controller can decide uniformly what is worth another attempt.

use std::time::Duration;

use anyhow::Context;
use marketsync_types::error::SourceError;
use marketsync_types::record::RawPayload;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde_json::Value;

const USER_AGENT: &str = concat!("marketsync/", env!("CARGO_PKG_VERSION"));
const BODY_HINT_LEN: usize = 200;

pub(crate) fn client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .context("Failed to build HTTP client")
}

/// Send `request` and decode the body as a JSON array of objects.
pub(crate) async fn fetch_array(
    request: reqwest::RequestBuilder,
) -> Result<Vec<RawPayload>, SourceError> {
    let response = request.send().await.map_err(|e| classify_transport(&e))?;
    let status = response.status();
    if !status.is_success() {
        let retry_after_ms = retry_after_ms(response.headers());
        let body = response.text().await.unwrap_or_default();
        return Err(SourceError::from_status(
            status.as_u16(),
            retry_after_ms,
            body_hint(&body),
        ));
    }
    let body = response.bytes().await.map_err(|e| classify_transport(&e))?;
    payloads_from_body(&body)
}

pub(crate) fn payloads_from_body(body: &[u8]) -> Result<Vec<RawPayload>, SourceError> {
    let value: Value = serde_json::from_slice(body).map_err(|e| {
        SourceError::malformed("INVALID_JSON", format!("response is not valid JSON: {e}"))
    })?;
    let Value::Array(items) = value else {
        return Err(SourceError::malformed(
            "NOT_ARRAY",
            format!("expected a JSON array, got {}", body_hint(&value.to_string())),
        ));
    };
    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            RawPayload::try_from(item).map_err(|other| {
                SourceError::malformed(
                    "NOT_OBJECT",
                    format!(
                        "element {index} is not an object: {}",
                        body_hint(&other.to_string())
                    ),
                )
            })
        })
        .collect()
}

fn classify_transport(err: &reqwest::Error) -> SourceError {
    if err.is_timeout() {
        SourceError::timeout(err.to_string())
    } else if err.is_connect() {
        SourceError::network("CONNECT", err.to_string())
    } else if err.is_builder() {
        SourceError::malformed("INVALID_REQUEST", err.to_string())
    } else if err.is_body() || err.is_decode() {
        SourceError::network("BODY", err.to_string())
    } else {
        SourceError::network("REQUEST", err.to_string())
    }
}

/// `Retry-After` in delta-seconds form, converted to milliseconds.
fn retry_after_ms(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|secs| secs.saturating_mul(1_000))
}

fn body_hint(body: &str) -> &str {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(BODY_HINT_LEN) {
        Some((end, _)) => &trimmed[..end],
        None => trimmed,
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use marketsync_types::error::ErrorCategory;

    #[test]
    fn test_array_of_objects_is_accepted() {
        let payloads = payloads_from_body(br#"[{"symbol":"BTC"},{"symbol":"ETH"}]"#).unwrap();
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[1].get("symbol").unwrap(), "ETH");
    }

    #[test]
    fn test_envelope_object_is_malformed() {
        let err = payloads_from_body(br#"{"error":"nope"}"#).unwrap_err();
        assert_eq!(err.category, ErrorCategory::Malformed);
        assert_eq!(err.code, "NOT_ARRAY");
        assert!(!err.retryable);
    }

    #[test]
    fn test_non_object_element_is_malformed() {
        let err = payloads_from_body(br#"[{"symbol":"BTC"}, 3]"#).unwrap_err();
        assert_eq!(err.code, "NOT_OBJECT");
        assert!(err.message.contains("element 1"));
    }

    #[test]
    fn test_invalid_json_is_malformed() {
        let err = payloads_from_body(b"<html>").unwrap_err();
        assert_eq!(err.code, "INVALID_JSON");
    }

    #[test]
    fn test_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, "7".parse().unwrap());
        assert_eq!(retry_after_ms(&headers), Some(7_000));
        headers.insert(RETRY_AFTER, "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap());
        assert_eq!(retry_after_ms(&headers), None);
    }

    #[test]
    fn test_body_hint_truncates() {
        let long = "x".repeat(500);
        assert_eq!(body_hint(&long).len(), BODY_HINT_LEN);
        assert_eq!(body_hint("  short "), "short");
    }

    #[tokio::test]
    async fn test_status_classification_over_the_wire() {
        let base = testing::serve(vec![
            (429, vec![("retry-after", "2".to_string())], String::new()),
            (503, vec![], "maintenance".to_string()),
            (404, vec![], "not found".to_string()),
        ])
        .await;
        let client = client(Duration::from_secs(5)).unwrap();

        let err = fetch_array(client.get(&base)).await.unwrap_err();
        assert_eq!(err.category, ErrorCategory::RateLimit);
        assert_eq!(err.retry_after_ms, Some(2_000));

        let err = fetch_array(client.get(&base)).await.unwrap_err();
        assert_eq!(err.category, ErrorCategory::Server);
        assert!(err.retryable);
        assert!(err.message.contains("maintenance"));

        let err = fetch_array(client.get(&base)).await.unwrap_err();
        assert_eq!(err.category, ErrorCategory::Client);
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn test_connection_refused_is_retryable_network() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let client = client(Duration::from_secs(5)).unwrap();
        let err = fetch_array(client.get(format!("http://{addr}")))
            .await
            .unwrap_err();
        assert!(err.retryable);
        assert!(matches!(
            err.category,
            ErrorCategory::Network | ErrorCategory::Timeout
        ));
    }
}
