//! Retry policy shared by the transport engine and the persistence gateway

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::error::{Result, SyncError};

/// Classes of request failure that happen before an HTTP status is available
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Could not connect (DNS, refused, reset)
    Connect,
    /// Request or read timed out
    Timeout,
    /// Connection dropped while reading the body
    Body,
    /// Anything else (invalid request, redirect loop)
    Other,
}

/// Retry behavior for one provider (or for the store).
///
/// `max_attempts` counts the first try. With the default multiplier of 1.0 the
/// delay between attempts is a fixed `backoff_delay`. A growing delay stops at
/// `max_delay`, or at [`UNCAPPED_BACKOFF_CEILING`] when `max_delay` is zero.
/// Longest delay a growing backoff reaches when no cap is configured
pub const UNCAPPED_BACKOFF_CEILING: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "duration_ms", rename = "backoff_ms")]
    pub backoff_delay: Duration,
    pub backoff_multiplier: f64,
    #[serde(with = "duration_ms", rename = "max_backoff_ms")]
    pub max_delay: Duration,
    pub retryable_statuses: HashSet<u16>,
    pub retryable_exceptions: HashSet<ErrorKind>,
}

impl RetryPolicy {
    /// Creates a fixed-delay policy with the default retryable sets
    pub fn new(max_attempts: u32, backoff_delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff_delay,
            ..Self::default()
        }
    }

    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            backoff_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_statuses = statuses.into_iter().collect();
        self
    }

    pub fn with_exceptions(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retryable_exceptions = kinds.into_iter().collect();
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64, max_delay: Duration) -> Self {
        self.backoff_multiplier = multiplier;
        self.max_delay = max_delay;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts < 1 {
            return Err(SyncError::Config(
                "retry policy max_attempts must be at least 1".to_string(),
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(SyncError::Config(
                "retry policy backoff_multiplier must be >= 1.0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retryable_statuses.contains(&status)
    }

    pub fn is_retryable_error(&self, kind: ErrorKind) -> bool {
        self.retryable_exceptions.contains(&kind)
    }

    /// Delay to wait after the given failed attempt (1-indexed)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        if self.backoff_multiplier <= 1.0 {
            return self.backoff_delay;
        }
        let ceiling = if self.max_delay.is_zero() {
            UNCAPPED_BACKOFF_CEILING
        } else {
            self.max_delay
        };
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let grown = self.backoff_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if !grown.is_finite() || grown >= ceiling.as_secs_f64() {
            ceiling
        } else {
            Duration::from_secs_f64(grown)
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_secs(2),
            backoff_multiplier: 1.0,
            max_delay: Duration::ZERO,
            retryable_statuses: [408, 429, 500, 502, 503, 504].into_iter().collect(),
            retryable_exceptions: [ErrorKind::Connect, ErrorKind::Timeout, ErrorKind::Body]
                .into_iter()
                .collect(),
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
