//! Backoff schedules and the bounded retry policy built on them.

use std::time::Duration;

/// How long to wait before the `retry`-th retry (0-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay every time. Used for reconnects, where bounding failover
    /// latency matters more than easing load on one endpoint.
    Fixed(Duration),
    /// `initial * multiplier^retry`, capped at `max`.
    Exponential {
        initial: Duration,
        multiplier: u32,
        max: Duration,
    },
}

impl Backoff {
    pub fn delay(&self, retry: u32) -> Duration {
        match *self {
            Self::Fixed(d) => d,
            Self::Exponential { initial, multiplier, max } => multiplier
                .checked_pow(retry)
                .and_then(|factor| initial.checked_mul(factor))
                .map_or(max, |d| d.min(max)),
        }
    }
}

/// A retry budget plus the schedule to spend it on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    /// Five retries at 1s, 2s, 4s, 8s, 16s.
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff: Backoff::Exponential {
                initial: Duration::from_secs(1),
                multiplier: 2,
                max: Duration::from_secs(60),
            },
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Backoff) -> Self {
        Self { max_retries, backoff }
    }

    /// Delay before retry number `retry_count` (0-based), or `None` once the
    /// budget is spent.
    pub fn next_delay(&self, retry_count: u32) -> Option<Duration> {
        (retry_count < self.max_retries).then(|| self.backoff.delay(retry_count))
    }

    /// Total attempts this policy allows, first try included.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}
