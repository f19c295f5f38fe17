//! Bounded retry with backoff for store conflicts
//!
//! The Ledger Engine re-runs the Locked phase of an operation when the store
//! reports a conflict. [`RetryPolicy`] bounds how many times that happens and
//! how long to wait between attempts.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay before every retry
    Fixed,

    /// base * retry
    Linear,

    /// base * 2^(retry - 1)
    #[default]
    Exponential,
}

/// Retry bound and delay schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included (at least 1)
    pub max_attempts: u32,

    pub base_delay: Duration,

    /// Upper bound for any single delay
    pub max_delay: Duration,

    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
            backoff: Backoff::Exponential,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            backoff: Backoff::Fixed,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            backoff: Backoff::Exponential,
        }
    }

    /// Attempts actually allowed; a zero bound still runs the operation once
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Whether another attempt may follow attempt number `attempt` (1-indexed)
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.attempts()
    }

    /// Delay before retry number `retry` (1-indexed; 0 means no wait)
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let delay = match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Linear => self.base_delay.saturating_mul(retry),
            Backoff::Exponential => {
                let factor = 2u32.checked_pow(retry - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };

        delay.min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn policy(backoff: Backoff) -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
            backoff,
        }
    }

    #[rstest]
    #[case::fixed_first(Backoff::Fixed, 1, 100)]
    #[case::fixed_later(Backoff::Fixed, 4, 100)]
    #[case::linear_second(Backoff::Linear, 2, 200)]
    #[case::linear_capped(Backoff::Linear, 20, 1_000)]
    #[case::exponential_first(Backoff::Exponential, 1, 100)]
    #[case::exponential_third(Backoff::Exponential, 3, 400)]
    #[case::exponential_capped(Backoff::Exponential, 10, 1_000)]
    #[case::exponential_huge(Backoff::Exponential, 64, 1_000)]
    #[case::no_wait(Backoff::Exponential, 0, 0)]
    fn test_delay_for_retry(#[case] backoff: Backoff, #[case] retry: u32, #[case] millis: u64) {
        assert_eq!(
            policy(backoff).delay_for_retry(retry),
            Duration::from_millis(millis)
        );
    }

    #[test]
    fn test_attempt_bound() {
        let policy = RetryPolicy::fixed(3, Duration::ZERO);
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_zero_bound_still_runs_once() {
        let policy = RetryPolicy {
            max_attempts: 0,
            ..Default::default()
        };
        assert_eq!(policy.attempts(), 1);
        assert!(!policy.should_retry(1));
        assert!(!RetryPolicy::no_retry().should_retry(1));
    }
}
