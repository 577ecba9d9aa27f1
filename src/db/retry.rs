//! Retry and backoff decisions.
//!
//! A failed attempt is retried only when its message or detail contains one of the
//! configured signatures and the retry budget is not spent. Timeouts are never
//! retried. The delay grows linearly: retry N waits `multiple_sec * N` seconds.

use crate::config::{
    DEFAULT_MAX_RETRIES, DEFAULT_RETRY_INTERVAL_MULTIPLE_SEC, DEFAULT_RETRYABLE_ERROR_TEXT,
    DbSettings,
};
use crate::error::RawDbError;
use std::time::Duration;

/// Retry configuration and decision logic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub retry_interval_multiple_sec: u64,
    /// Case-sensitive substrings marking an error as transient
    pub signatures: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_interval_multiple_sec: DEFAULT_RETRY_INTERVAL_MULTIPLE_SEC,
            signatures: DEFAULT_RETRYABLE_ERROR_TEXT
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl RetryPolicy {
    /// Build the policy from the `[db]` settings.
    pub fn from_settings(settings: &DbSettings) -> Self {
        Self {
            max_retries: settings.max_retries_or_default(),
            retry_interval_multiple_sec: settings.retry_interval_multiple_sec_or_default(),
            signatures: settings.retryable_error_text_or_default(),
        }
    }

    /// Create a policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Set max retries (builder pattern)
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the backoff multiple in seconds (builder pattern)
    pub fn with_retry_interval_multiple_sec(mut self, seconds: u64) -> Self {
        self.retry_interval_multiple_sec = seconds;
        self
    }

    /// Replace the signature list (builder pattern)
    pub fn with_signatures<I, S>(mut self, signatures: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.signatures = signatures.into_iter().map(Into::into).collect();
        self
    }

    /// First signature found in the error's message or detail.
    pub fn matching_signature(&self, error: &RawDbError) -> Option<&str> {
        self.signatures
            .iter()
            .find(|signature| !signature.is_empty() && error.contains(signature))
            .map(String::as_str)
    }

    /// Whether the error is transient. Timeouts never are.
    pub fn is_retryable(&self, error: &RawDbError) -> bool {
        !error.is_timeout() && self.matching_signature(error).is_some()
    }

    /// Whether another attempt should be made after `attempts_so_far` retries.
    pub fn should_retry(&self, error: &RawDbError, attempts_so_far: u32) -> bool {
        attempts_so_far < self.max_retries && self.is_retryable(error)
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        Duration::from_millis(
            self.retry_interval_multiple_sec
                .saturating_mul(1000)
                .saturating_mul(u64::from(retry)),
        )
    }
}
