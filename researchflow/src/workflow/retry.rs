//! Per-stage retry policy with configurable backoff and jitter.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// delay = base * attempt
    Linear,
    /// delay = base
    Fixed,
}

/// Jitter strategy to prevent thundering herd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter
    #[default]
    None,
    /// Random from 0 to delay
    Full,
    /// Half fixed, half random
    Equal,
}

/// Retry behaviour of a single stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first one.
    pub max_attempts: u32,
    /// Base delay between attempts in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    pub max_delay_ms: u64,
    /// Backoff strategy.
    pub backoff: BackoffStrategy,
    /// Jitter strategy.
    pub jitter: JitterStrategy,
    /// Whether a failure whose capability does not say otherwise is retried.
    pub retry_by_default: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff: BackoffStrategy::Exponential,
            jitter: JitterStrategy::None,
            retry_by_default: true,
        }
    }
}

impl RetryPolicy {
    /// Creates the default policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self::default().with_max_attempts(1)
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub const fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub const fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub const fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub const fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter = strategy;
        self
    }

    /// Sets the default retry eligibility.
    #[must_use]
    pub const fn with_retry_by_default(mut self, retry: bool) -> Self {
        self.retry_by_default = retry;
        self
    }

    /// Returns true if another attempt is allowed after `attempts_made`.
    #[must_use]
    pub const fn allows_another_attempt(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Delay before the attempt following failed attempt number
    /// `failed_attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, failed_attempt: u32) -> Duration {
        let base = self.base_delay_ms;
        let max = self.max_delay_ms;
        let step = failed_attempt.max(1);

        let delay = match self.backoff {
            BackoffStrategy::Exponential => {
                base.saturating_mul(2u64.saturating_pow(step - 1)).min(max)
            }
            BackoffStrategy::Linear => base.saturating_mul(u64::from(step)).min(max),
            BackoffStrategy::Fixed => base.min(max),
        };

        let jittered = match self.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
        };

        Duration::from_millis(jittered)
    }
}
