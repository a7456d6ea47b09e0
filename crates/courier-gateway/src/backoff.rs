//! Centralized retry/backoff policy.
//!
//! Every call site that needs a retry delay goes through
//! [`backoff_delay`]; there are no ad hoc delay tables anywhere else.

use crate::ErrorCategory;
use std::time::Duration;

/// Maximum backoff delay regardless of category.
const BACKOFF_MAX: Duration = Duration::from_secs(300);

/// Backoff delay before the next attempt, by category and prior retries.
///
/// Exponential doubling from a per-category base, capped at five
/// minutes. Rate-limit rejections get a much longer base than plain
/// transient failures - hammering a throttled channel only digs the
/// hole deeper. Returns `None` for categories that must not be retried.
pub fn backoff_delay(category: ErrorCategory, retry_count: i64) -> Option<Duration> {
    let base = match category {
        ErrorCategory::Transient | ErrorCategory::AbuseSignal => Duration::from_secs(2),
        ErrorCategory::RateLimited => Duration::from_secs(30),
        ErrorCategory::AuthExpired | ErrorCategory::Permanent => return None,
    };

    let shift = retry_count.clamp(0, 16) as u32;
    Some(std::cmp::min(base * 2u32.saturating_pow(shift), BACKOFF_MAX))
}

/// What to do with an entry after a rejected attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put the entry back as ready, eligible after the delay.
    Retry(Duration),
    /// Retry budget exhausted or category is not retryable.
    Fail,
}

/// Bounded retry policy.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts per entry, including the first.
    pub max_attempts: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

impl RetryPolicy {
    /// Decide the disposition of an entry that was just rejected.
    ///
    /// `retry_count` is the number of retries already recorded on the
    /// entry, i.e. the attempt that just failed was number
    /// `retry_count + 1`.
    pub fn decide(&self, category: ErrorCategory, retry_count: i64) -> RetryDecision {
        if retry_count + 1 >= self.max_attempts {
            return RetryDecision::Fail;
        }
        match backoff_delay(category, retry_count) {
            Some(delay) => RetryDecision::Retry(delay),
            None => RetryDecision::Fail,
        }
    }
}
