//! Structured error model for source fetches.
//!
//! [`SourceError`] carries classification and retry metadata. Construct it
//! through the category-specific factory methods so the `retryable` flag is
//! always consistent with the category.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Broad classification of a failure.
///
/// Determines default retry behavior and operator-facing categorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Adapter call exceeded its timeout (retryable).
    Timeout,
    /// HTTP 429 (retryable).
    RateLimit,
    /// Connection refused/reset and similar (retryable).
    Network,
    /// HTTP 5xx (retryable).
    Server,
    /// HTTP 4xx other than 429.
    Client,
    /// Response envelope could not be interpreted.
    Malformed,
    /// Local file access failure.
    Io,
    /// Record rejected by the normalizer.
    Validation,
    /// Simulated mid-run crash.
    Chaos,
    /// Run left `running` by a process that went away.
    Abandoned,
    /// Storage or orchestration failure.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::RateLimit => "rate_limit",
            Self::Network => "network",
            Self::Server => "server",
            Self::Client => "client",
            Self::Malformed => "malformed",
            Self::Io => "io",
            Self::Validation => "validation",
            Self::Chaos => "chaos",
            Self::Abandoned => "abandoned",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Structured error from a source adapter call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("[{category}] {code}: {message}")]
pub struct SourceError {
    pub category: ErrorCategory,
    pub code: String,
    pub message: String,
    pub retryable: bool,
    /// HTTP status, when the failure came from a response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Upstream-requested minimum wait before the next attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl SourceError {
    fn new(
        category: ErrorCategory,
        retryable: bool,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retryable,
            status: None,
            retry_after_ms: None,
        }
    }

    /// Call timed out (retryable).
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Timeout, true, "TIMEOUT", message)
    }

    /// HTTP 429 (retryable), optionally with the upstream `Retry-After`.
    #[must_use]
    pub fn rate_limit(message: impl Into<String>, retry_after_ms: Option<u64>) -> Self {
        let mut err = Self::new(ErrorCategory::RateLimit, true, "RATE_LIMITED", message);
        err.status = Some(429);
        err.retry_after_ms = retry_after_ms;
        err
    }

    /// Transport-level failure (retryable).
    #[must_use]
    pub fn network(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Network, true, code, message)
    }

    /// HTTP 5xx (retryable).
    #[must_use]
    pub fn server(status: u16, message: impl Into<String>) -> Self {
        let mut err = Self::new(ErrorCategory::Server, true, format!("HTTP_{status}"), message);
        err.status = Some(status);
        err
    }

    /// HTTP 4xx other than 429 (not retryable).
    #[must_use]
    pub fn client(status: u16, message: impl Into<String>) -> Self {
        let mut err = Self::new(ErrorCategory::Client, false, format!("HTTP_{status}"), message);
        err.status = Some(status);
        err
    }

    /// Response body did not have the expected envelope (not retryable).
    #[must_use]
    pub fn malformed(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Malformed, false, code, message)
    }

    /// Local file failure (not retryable).
    #[must_use]
    pub fn io(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Io, false, code, message)
    }

    /// Classify an HTTP status that is not a success.
    ///
    /// 429 and 5xx are retryable, every other status is a client error.
    #[must_use]
    pub fn from_status(status: u16, retry_after_ms: Option<u64>, body_hint: &str) -> Self {
        let message = if body_hint.is_empty() {
            format!("upstream returned HTTP {status}")
        } else {
            format!("upstream returned HTTP {status}: {body_hint}")
        };
        match status {
            429 => Self::rate_limit(message, retry_after_ms),
            500..=599 => Self::server(status, message),
            _ => Self::client(status, message),
        }
    }
}
