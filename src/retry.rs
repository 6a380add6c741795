//! Per-request retry policy with timeout backoff.
//!
//! # Overview
//!
//! A failed attempt is retried in place, on the same worker, only when the
//! error is a timeout or an authentication failure. Each retry grows the
//! socket timeout by `timeout * backoff_multiplier`; there is no sleep between
//! attempts. The policy is exhausted once the retry count exceeds
//! `max_retries`.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use fetchq_core::{RequestError, RetryDecision, RetryPolicy};
//!
//! let mut policy = RetryPolicy::default();
//! let error = RequestError::timeout("https://example.com/feed");
//!
//! match policy.should_retry(&error) {
//!     RetryDecision::Retry { timeout, attempt } => {
//!         assert_eq!(timeout, Duration::from_millis(5000));
//!         assert_eq!(attempt, 1);
//!     }
//!     RetryDecision::DoNotRetry { reason } => panic!("unexpected: {reason}"),
//! }
//! ```

use std::time::Duration;

use tracing::{debug, instrument};

use crate::error::RequestError;

/// Default socket timeout for the first attempt (2.5 seconds).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2500);

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 1;

/// Default backoff multiplier.
pub const DEFAULT_BACKOFF_MULTIPLIER: f32 = 1.0;

/// Retry budget for file downloads, which resume rather than restart.
pub const DOWNLOAD_MAX_RETRIES: u32 = 200;

/// Ceiling for the grown timeout; long retry budgets would otherwise overflow.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(3600);

/// Decision on whether to retry a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run another attempt with the given timeout.
    Retry {
        /// Socket timeout for the next attempt.
        timeout: Duration,
        /// Retry number (1 for the first retry).
        attempt: u32,
    },

    /// Give up and deliver the error.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Mutable retry state owned by one request.
///
/// # Default Values
///
/// - `timeout`: 2500 ms
/// - `max_retries`: 1
/// - `backoff_multiplier`: 1.0
///
/// # Timeout Growth
///
/// ```text
/// timeout = timeout + timeout * backoff_multiplier
/// ```
///
/// With defaults the single retry runs with a 5 second timeout.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    current_timeout: Duration,
    current_retry_count: u32,
    max_retries: u32,
    backoff_multiplier: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT, DEFAULT_MAX_RETRIES, DEFAULT_BACKOFF_MULTIPLIER)
    }
}

impl RetryPolicy {
    /// Creates a policy with custom settings.
    ///
    /// # Arguments
    ///
    /// * `initial_timeout` - Socket timeout of the first attempt
    /// * `max_retries` - Retries allowed after the first attempt
    /// * `backoff_multiplier` - Fraction of the current timeout added per retry
    #[must_use]
    pub fn new(initial_timeout: Duration, max_retries: u32, backoff_multiplier: f32) -> Self {
        Self {
            current_timeout: initial_timeout,
            current_retry_count: 0,
            max_retries,
            backoff_multiplier: backoff_multiplier.max(0.0),
        }
    }

    /// Creates a policy with a custom retry budget, using defaults otherwise.
    #[must_use]
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Socket timeout for the next attempt.
    #[must_use]
    pub fn current_timeout(&self) -> Duration {
        self.current_timeout
    }

    /// Retries performed so far.
    #[must_use]
    pub fn current_retry_count(&self) -> u32 {
        self.current_retry_count
    }

    /// Configured retry budget.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Returns true while the retry count has not exceeded the budget.
    #[must_use]
    pub fn has_attempt_remaining(&self) -> bool {
        self.current_retry_count <= self.max_retries
    }

    /// Records a failed attempt and decides whether to run another.
    ///
    /// Errors other than timeouts and authentication failures are never
    /// retried and leave the policy untouched.
    #[instrument(skip(self, error), fields(kind = error.kind(), max_retries = self.max_retries))]
    pub fn should_retry(&mut self, error: &RequestError) -> RetryDecision {
        if !error.is_retryable() {
            return RetryDecision::DoNotRetry {
                reason: format!("{} errors are not retried", error.kind()),
            };
        }

        self.current_retry_count += 1;
        self.current_timeout = grow(self.current_timeout, self.backoff_multiplier);

        if !self.has_attempt_remaining() {
            debug!(retries = self.current_retry_count, "retry budget exhausted");
            return RetryDecision::DoNotRetry {
                reason: format!("max retries ({}) exhausted", self.max_retries),
            };
        }

        debug!(
            attempt = self.current_retry_count,
            timeout_ms = self.current_timeout.as_millis(),
            "will retry"
        );

        RetryDecision::Retry {
            timeout: self.current_timeout,
            attempt: self.current_retry_count,
        }
    }
}

/// Adds `timeout * multiplier` to `timeout`, saturating at [`MAX_TIMEOUT`].
fn grow(timeout: Duration, multiplier: f32) -> Duration {
    let secs = timeout.as_secs_f64() * (1.0 + f64::from(multiplier));
    Duration::try_from_secs_f64(secs).map_or(MAX_TIMEOUT, |grown| grown.min(MAX_TIMEOUT))
}
