//! Exponential backoff for handler retries.
//!
//! Jitter-free geometric growth with a ceiling on total elapsed retry time.
//! Once the ceiling is reached, `next_interval` keeps returning the maximum
//! configured interval rather than erroring, so a caller can always sleep on
//! the result.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Backoff policy parameters.
///
/// One policy is shared across all topic loops; each retry sequence gets its
/// own [`Backoff`] state via [`BackoffPolicy::start`], so a slow message on
/// one topic cannot inflate the delays seen by another.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// First retry delay in milliseconds (default: 500).
    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,

    /// Growth factor applied after each retry (default: 1.5).
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Ceiling on a single delay in seconds (default: 60).
    #[serde(default = "default_max_interval_secs")]
    pub max_interval_secs: u64,

    /// Ceiling on total elapsed retry time in seconds (default: 300).
    /// Beyond this, every interval is the maximum interval.
    #[serde(default = "default_max_elapsed_secs")]
    pub max_elapsed_secs: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_interval_ms: default_initial_interval_ms(),
            multiplier: default_multiplier(),
            max_interval_secs: default_max_interval_secs(),
            max_elapsed_secs: default_max_elapsed_secs(),
        }
    }
}

fn default_initial_interval_ms() -> u64 {
    500
}

fn default_multiplier() -> f64 {
    1.5
}

fn default_max_interval_secs() -> u64 {
    60
}

fn default_max_elapsed_secs() -> u64 {
    300
}

impl BackoffPolicy {
    /// Begin a fresh retry sequence. The elapsed-time clock starts now.
    pub fn start(&self) -> Backoff {
        Backoff {
            current: Duration::from_millis(self.initial_interval_ms),
            multiplier: self.multiplier,
            max_interval: Duration::from_secs(self.max_interval_secs),
            max_elapsed: Duration::from_secs(self.max_elapsed_secs),
            started_at: Instant::now(),
        }
    }
}

/// Mutable state for one retry sequence.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    multiplier: f64,
    max_interval: Duration,
    max_elapsed: Duration,
    started_at: Instant,
}

impl Backoff {
    /// Return the next delay and advance the sequence.
    ///
    /// Intervals are non-decreasing. After `max_elapsed` has passed since
    /// the sequence started, the maximum interval is returned indefinitely.
    pub fn next_interval(&mut self) -> Duration {
        if self.started_at.elapsed() >= self.max_elapsed {
            return self.max_interval;
        }

        let interval = self.current;
        self.current = Duration::min(self.current.mul_f64(self.multiplier), self.max_interval);
        interval
    }
}
