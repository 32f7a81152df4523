//! Scheduler configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Longest the scan loop waits while the store is unavailable.
pub const MAX_STORE_BACKOFF: Duration = Duration::from_secs(30);

/// Configuration for the scheduler and its worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Upper bound on the time between scans of the job store.
    pub tick_interval: Duration,
    /// Number of concurrent workers; read through [`SchedulerConfig::workers`].
    workers: usize,
    /// Timeout for a single publish or notify call.
    pub call_timeout: Duration,
    /// A `Running` job not updated for this long is assumed orphaned.
    pub stale_after: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            workers: 10,
            call_timeout: Duration::from_secs(30),
            stale_after: Duration::from_secs(600),
        }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Set the worker count. Zero is raised to one when read.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Worker count, never less than one.
    pub fn workers(&self) -> usize {
        self.workers.max(1)
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_stale_after(mut self, after: Duration) -> Self {
        self.stale_after = after;
        self
    }

    /// Stale threshold, never shorter than twice the call timeout.
    pub fn effective_stale_after(&self) -> Duration {
        self.stale_after.max(self.call_timeout.saturating_mul(2))
    }
}
