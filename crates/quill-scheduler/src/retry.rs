//! Retry and backoff policy for failed executions.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What to do with a job after a failed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run again after the delay.
    Retry { delay: Duration },
    /// Mark the job failed permanently.
    GiveUp,
}

/// Exponential backoff: `base_delay * 2^(attempt - 1)`, capped at `max_delay`
/// when set, with a ceiling on the number of attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Attempts after which a job fails regardless of the error.
    pub max_attempts: u32,
    /// Upper bound on any single delay.
    pub max_delay: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_attempts: 5,
            max_delay: None,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }

    pub fn with_max_delay(mut self, max: Duration) -> Self {
        self.max_delay = Some(max);
        self
    }

    /// Delay to wait after the `attempt`-th failed execution (1-based).
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }

    /// Decide what happens after the `attempt`-th execution failed.
    pub fn decide(&self, attempt: u32, retryable: bool) -> RetryDecision {
        if !retryable || attempt >= self.max_attempts {
            RetryDecision::GiveUp
        } else {
            RetryDecision::Retry {
                delay: self.next_delay(attempt),
            }
        }
    }
}
