//! Exponential backoff with jitter around adapter calls.
//!
//! [`call_with_retry`] is the single wrapper every adapter call goes
//! through. Each call runs under a timeout; a timeout is a retryable
//! failure like any other transient error.

use std::future::Future;
use std::time::Duration;

use marketsync_types::error::SourceError;
use marketsync_types::state::SourceName;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::types::ResourceConfig;
use crate::metrics::{self, AttemptOutcome};

/// Predicate deciding whether a failure is worth another attempt.
pub type RetryPredicate = fn(&SourceError) -> bool;

fn default_retry_if(err: &SourceError) -> bool {
    err.retryable
}

/// Retry parameters applied uniformly to every adapter call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Per-attempt timeout.
    pub request_timeout: Duration,
    pub retry_if: RetryPredicate,
    /// Fixed seed for the jitter RNG (tests).
    pub jitter_seed: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_resources(&ResourceConfig::default())
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn from_resources(resources: &ResourceConfig) -> Self {
        Self {
            max_attempts: resources.max_attempts.max(1),
            base_delay: Duration::from_millis(resources.base_delay_ms),
            max_delay: Duration::from_millis(resources.max_delay_ms),
            request_timeout: resources.request_timeout(),
            retry_if: default_retry_if,
            jitter_seed: None,
        }
    }

    #[must_use]
    pub fn with_jitter_seed(mut self, seed: u64) -> Self {
        self.jitter_seed = Some(seed);
        self
    }

    /// Delay before attempt `attempt + 1`.
    ///
    /// `base * 2^(attempt-1) + jitter`, raised to `retry_after` when the
    /// upstream asked for longer, then capped at `max_delay`.
    #[must_use]
    pub fn backoff_delay(
        &self,
        attempt: u32,
        jitter: Duration,
        retry_after: Option<Duration>,
    ) -> Duration {
        let factor = 2u64
            .checked_pow(attempt.saturating_sub(1))
            .unwrap_or(u64::MAX);
        let exp_ms = duration_ms(self.base_delay).saturating_mul(factor);
        let mut delay = Duration::from_millis(exp_ms).saturating_add(jitter);
        if let Some(retry_after) = retry_after {
            delay = delay.max(retry_after);
        }
        delay.min(self.max_delay)
    }

    /// Upper bound on the time one source can spend in [`call_with_retry`]:
    /// every attempt runs into `request_timeout` and every wait is
    /// stretched to `max_delay` by a `Retry-After` hint.
    #[must_use]
    pub fn worst_case_window(&self) -> Duration {
        let attempts = self.max_attempts.max(1);
        (1..attempts)
            .map(|attempt| self.backoff_delay(attempt, self.base_delay, Some(self.max_delay)))
            .fold(
                self.request_timeout.saturating_mul(attempts),
                Duration::saturating_add,
            )
    }

    /// Random jitter in `[0, base_delay)`.
    fn jitter(&self, rng: &mut StdRng) -> Duration {
        let base_ms = duration_ms(self.base_delay);
        if base_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rng.gen_range(0..base_ms))
    }

    fn rng(&self) -> StdRng {
        match self.jitter_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }
}

/// Audit entry for one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchAttempt {
    pub attempt: u32,
    /// `None` when the attempt succeeded.
    pub error: Option<SourceError>,
    /// Wait scheduled before the next attempt, if one follows.
    pub delay_before_next: Option<Duration>,
}

/// Result of a retried call plus the full attempt history.
#[derive(Debug)]
pub struct RetryReport<T> {
    pub result: Result<T, SourceError>,
    pub attempts: Vec<FetchAttempt>,
}

impl<T> RetryReport<T> {
    #[must_use]
    pub fn attempt_count(&self) -> u32 {
        u32::try_from(self.attempts.len()).unwrap_or(u32::MAX)
    }

    /// Inter-attempt delays in order.
    #[must_use]
    pub fn delays(&self) -> Vec<Duration> {
        self.attempts
            .iter()
            .filter_map(|a| a.delay_before_next)
            .collect()
    }
}

/// Invoke `op` until it succeeds, fails permanently, or `max_attempts` is
/// reached. Delays never decrease from one attempt to the next.
pub async fn call_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    source: &SourceName,
    mut op: F,
) -> RetryReport<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SourceError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut rng = policy.rng();
    let mut attempts = Vec::new();
    let mut previous_delay = Duration::ZERO;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let result = match tokio::time::timeout(policy.request_timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(SourceError::timeout(format!(
                "call exceeded {}ms",
                duration_ms(policy.request_timeout)
            ))),
        };

        match result {
            Ok(value) => {
                metrics::fetch_attempt(source, AttemptOutcome::Success);
                tracing::debug!(source = %source, attempt, "Source fetch succeeded");
                attempts.push(FetchAttempt {
                    attempt,
                    error: None,
                    delay_before_next: None,
                });
                return RetryReport {
                    result: Ok(value),
                    attempts,
                };
            }
            Err(err) if (policy.retry_if)(&err) && attempt < max_attempts => {
                let jitter = policy.jitter(&mut rng);
                let retry_after = err.retry_after_ms.map(Duration::from_millis);
                let delay = policy
                    .backoff_delay(attempt, jitter, retry_after)
                    .max(previous_delay);
                previous_delay = delay;
                metrics::fetch_attempt(source, AttemptOutcome::Retry);
                tracing::warn!(
                    source = %source,
                    attempt,
                    max_attempts,
                    delay_ms = duration_ms(delay),
                    category = %err.category,
                    code = %err.code,
                    "Retryable source error, will retry"
                );
                attempts.push(FetchAttempt {
                    attempt,
                    error: Some(err),
                    delay_before_next: Some(delay),
                });
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                metrics::fetch_attempt(source, AttemptOutcome::Failed);
                if (policy.retry_if)(&err) {
                    tracing::error!(
                        source = %source,
                        attempt,
                        max_attempts,
                        category = %err.category,
                        code = %err.code,
                        "Retries exhausted, failing source"
                    );
                } else {
                    tracing::error!(
                        source = %source,
                        attempt,
                        category = %err.category,
                        code = %err.code,
                        "Non-retryable source error, failing source"
                    );
                }
                attempts.push(FetchAttempt {
                    attempt,
                    error: Some(err.clone()),
                    delay_before_next: None,
                });
                return RetryReport {
                    result: Err(err),
                    attempts,
                };
            }
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
