//! Bounded retry with exponential backoff.
//!
//! The policy is plain data so callers decide how to sleep; tests drive the
//! zero-retry and exhausted-retry paths without real delays.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry budget: one initial attempt plus up to `max_retries` more.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the initial attempt (0 = try exactly once).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay_ms: u64,
    /// Cap for the exponential growth.
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    /// Single attempt, no waiting.
    pub const NONE: Self = Self {
        max_retries: 0,
        initial_delay_ms: 0,
        max_delay_ms: 0,
        backoff_multiplier: 1.0,
    };

    pub fn new(max_retries: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay_ms: initial_delay.as_millis() as u64,
            max_delay_ms: max_delay.as_millis() as u64,
            backoff_multiplier: 2.0,
        }
    }

    /// Total attempts allowed, including the first.
    pub fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `retry` (0-indexed), capped at `max_delay_ms`.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let multiplier = self.backoff_multiplier.max(1.0).powi(retry as i32);
        let delay_ms = (self.initial_delay_ms as f64 * multiplier).min(self.max_delay_ms as f64);
        Duration::from_millis(delay_ms as u64)
    }

    /// All delays the policy can produce, in order.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_retries).map(|retry| self.delay_for_retry(retry))
    }

    /// Upper bound on the time spent sleeping between attempts.
    pub fn total_max_wait(&self) -> Duration {
        self.delays().sum()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(2, Duration::from_secs(2), Duration::from_secs(10))
    }
}
