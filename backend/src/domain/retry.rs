//! Retry accounting and backoff for failed deliveries.
//!
//! Two failure sites share one policy:
//!
//! - the scheduler, when handing a claimed row to the delayed queue fails;
//! - the delivery worker, when the channel sender fails.
//!
//! The scheduler compares before incrementing, while the worker increments
//! first. With `max_retries = 3` the worker therefore marks a row `Failed` on
//! its third consecutive send failure.

use std::time::Duration;

/// What happens to `retry_count` when a row enters `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExhaustedRetryCount {
    /// Keep the attempt count, so operators see how many attempts were made.
    #[default]
    Preserve,
    /// Reset it to zero, so a manual requeue starts with a fresh budget.
    Reset,
}

/// Outcome of recording one failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retries remain; store the row `Pending` with this count.
    Retry {
        /// Updated retry count.
        retry_count: u32,
    },
    /// Retries are exhausted; store the row `Failed` with this count.
    Exhausted {
        /// Retry count to persist alongside `Failed`.
        retry_count: u32,
    },
}

impl RetryDecision {
    /// The count to persist, whichever way the decision went.
    pub const fn retry_count(self) -> u32 {
        match self {
            Self::Retry { retry_count } | Self::Exhausted { retry_count } => retry_count,
        }
    }
}

/// Maximum attempt budget and the exhaustion rule.
///
/// # Example
///
/// ```
/// use notifier::domain::{ExhaustedRetryCount, RetryDecision, RetryPolicy};
///
/// let policy = RetryPolicy::new(3, ExhaustedRetryCount::Preserve);
/// assert_eq!(policy.after_send_failure(0), RetryDecision::Retry { retry_count: 1 });
/// assert_eq!(policy.after_send_failure(2), RetryDecision::Exhausted { retry_count: 3 });
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    exhausted_retry_count: ExhaustedRetryCount,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, ExhaustedRetryCount::default())
    }
}

impl RetryPolicy {
    /// Create a policy allowing `max_retries` failures.
    pub const fn new(max_retries: u32, exhausted_retry_count: ExhaustedRetryCount) -> Self {
        Self {
            max_retries,
            exhausted_retry_count,
        }
    }

    /// Configured attempt budget.
    pub const fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Decision after the delayed queue rejected a publish.
    pub const fn after_publish_failure(&self, retry_count: u32) -> RetryDecision {
        if retry_count < self.max_retries {
            RetryDecision::Retry {
                retry_count: retry_count.saturating_add(1),
            }
        } else {
            self.exhausted(retry_count)
        }
    }

    /// Decision after a channel sender failed.
    pub const fn after_send_failure(&self, retry_count: u32) -> RetryDecision {
        let next = retry_count.saturating_add(1);
        if next < self.max_retries {
            RetryDecision::Retry { retry_count: next }
        } else {
            self.exhausted(next)
        }
    }

    const fn exhausted(&self, retry_count: u32) -> RetryDecision {
        let retry_count = match self.exhausted_retry_count {
            ExhaustedRetryCount::Preserve => retry_count,
            ExhaustedRetryCount::Reset => 0,
        };
        RetryDecision::Exhausted { retry_count }
    }
}

/// Delay before the next delivery attempt, as a function of the retry count.
pub trait BackoffPolicy: Send + Sync {
    /// Delay to add to "now" after the `retry_count`-th failure.
    fn delay(&self, retry_count: u32) -> Duration;
}

/// `retry_count² × unit` backoff; with the default one-minute unit the
/// attempts after 1, 2, 3 failures wait 1, 4, 9 minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuadraticBackoff {
    unit: Duration,
}

impl QuadraticBackoff {
    /// Backoff growing in multiples of `unit`.
    pub const fn new(unit: Duration) -> Self {
        Self { unit }
    }
}

impl Default for QuadraticBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl BackoffPolicy for QuadraticBackoff {
    fn delay(&self, retry_count: u32) -> Duration {
        let factor = retry_count.saturating_mul(retry_count);
        self.unit.saturating_mul(factor)
    }
}
