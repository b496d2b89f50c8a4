use std::time::Duration;

use marketsync_engine::config::parser;
use marketsync_engine::config::validator;
use marketsync_engine::normalize::{normalize, FieldMapping, ValidationError};
use marketsync_engine::retry::{call_with_retry, RetryPolicy};
use marketsync_types::error::SourceError;
use marketsync_types::record::RawPayload;
use marketsync_types::state::SourceName;
use proptest::prelude::*;
use serde_json::json;

fn policy(max_attempts: u32, base_ms: u64, max_ms: u64, seed: u64) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(base_ms),
        max_delay: Duration::from_millis(max_ms),
        ..RetryPolicy::default()
    }
    .with_jitter_seed(seed)
}

proptest! {
    #[test]
    fn backoff_never_exceeds_cap_and_honors_retry_after(
        attempt in 1_u32..40,
        base_ms in 1_u64..2_000,
        extra_ms in 0_u64..60_000,
        jitter_ms in 0_u64..2_000,
        retry_after_ms in proptest::option::of(0_u64..120_000),
    ) {
        let max_ms = base_ms + extra_ms;
        let policy = policy(5, base_ms, max_ms, 7);
        let delay = policy.backoff_delay(
            attempt,
            Duration::from_millis(jitter_ms),
            retry_after_ms.map(Duration::from_millis),
        );

        prop_assert!(delay <= Duration::from_millis(max_ms));
        if let Some(retry_after) = retry_after_ms {
            prop_assert!(delay >= Duration::from_millis(retry_after.min(max_ms)));
        }
    }

    #[test]
    fn retry_schedule_is_bounded_and_non_decreasing(
        max_attempts in 1_u32..7,
        base_ms in 1_u64..500,
        extra_ms in 0_u64..5_000,
        seed in any::<u64>(),
        retry_after_ms in proptest::collection::vec(proptest::option::of(0_u64..3_000), 8),
    ) {
        let policy = policy(max_attempts, base_ms, base_ms + extra_ms, seed);
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap();

        let report = runtime.block_on(async {
            let mut call = 0_usize;
            call_with_retry(&policy, &SourceName::new("prop"), || {
                let hint = retry_after_ms[call % retry_after_ms.len()];
                call += 1;
                async move {
                    Err::<(), _>(SourceError::rate_limit("throttled", hint))
                }
            })
            .await
        });

        prop_assert_eq!(report.attempt_count(), max_attempts);
        prop_assert!(report.result.is_err());
        let delays = report.delays();
        prop_assert_eq!(delays.len() as u32, max_attempts - 1);
        for pair in delays.windows(2) {
            prop_assert!(pair[0] <= pair[1], "delays decreased: {:?}", delays);
        }
        prop_assert!(delays.iter().all(|d| *d <= policy.max_delay));
    }

    #[test]
    fn negative_price_is_always_rejected(price in -1.0e12_f64..-1.0e-9) {
        let payload = RawPayload::try_from(json!({
            "symbol": "btc",
            "price": price,
            "timestamp": "2025-12-11T10:00:00Z",
        }))
        .unwrap();
        let err = normalize(&payload, &FieldMapping::default(), &SourceName::new("prop"))
            .unwrap_err();
        let is_negative = matches!(err, ValidationError::Negative { .. });
        prop_assert!(is_negative);
    }

    #[test]
    fn valid_record_normalizes_symbol_and_keeps_price(
        symbol in "[a-zA-Z]{1,8}",
        price in 0.0_f64..1.0e9,
        epoch_secs in 1_000_000_000_i64..4_000_000_000,
    ) {
        let payload = RawPayload::try_from(json!({
            "symbol": format!("  {symbol} "),
            "price": price.to_string(),
            "timestamp": epoch_secs,
        }))
        .unwrap();
        let observation = normalize(&payload, &FieldMapping::default(), &SourceName::new("prop"))
            .unwrap();

        prop_assert_eq!(observation.symbol, symbol.to_uppercase());
        prop_assert_eq!(observation.price, price);
        prop_assert_eq!(observation.observed_at.timestamp(), epoch_secs);
    }

    #[test]
    fn csv_source_requires_path(has_path in any::<bool>()) {
        let path_line = if has_path { "\n    path: data.csv" } else { "" };
        let yaml = format!(
            r#"
version: "1.0"
pipeline: prop_csv_policy
sources:
  - name: upload
    kind: csv{path_line}
"#
        );

        let config = parser::parse_pipeline_str(&yaml).expect("generated yaml must parse");
        let result = validator::validate_pipeline(&config);

        if has_path {
            prop_assert!(result.is_ok());
        } else {
            prop_assert!(result.is_err());
        }
    }

    #[test]
    fn resource_minimums_are_enforced(
        max_attempts in 0_u32..4,
        concurrency in 0_usize..4,
        batch_size in 0_usize..4,
    ) {
        let yaml = format!(
            r#"
version: "1.0"
pipeline: prop_resources
sources:
  - name: upload
    kind: csv
    path: data.csv
resources:
  max_attempts: {max_attempts}
  concurrency: {concurrency}
  batch_size: {batch_size}
"#
        );

        let config = parser::parse_pipeline_str(&yaml).expect("generated yaml must parse");
        let result = validator::validate_pipeline(&config);
        let valid = max_attempts >= 1 && concurrency >= 1 && batch_size >= 1;
        prop_assert_eq!(result.is_ok(), valid);
    }
}
