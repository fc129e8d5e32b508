//! Exponential backoff with jitter for retried jobs.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::duration_ms;

/// Retry delay policy: `min(max_delay, base_delay * 2^attempt) * (1 ± jitter)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    /// Fraction in `[0, 1)`; values outside are clamped.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            ..Self::default()
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before the retry that follows a failure at `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    /// Same as [`delay_for`](Self::delay_for) with a caller-supplied RNG.
    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let capped = self.capped_delay(attempt);
        let jitter = self.clamped_jitter();
        if jitter == 0.0 || capped.is_zero() {
            return capped;
        }
        let factor = 1.0 + rng.gen_range(-jitter..=jitter);
        capped.mul_f64(factor)
    }

    /// The un-jittered delay for `attempt`.
    pub fn capped_delay(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(multiplier).min(self.max_delay)
    }

    fn clamped_jitter(&self) -> f64 {
        if self.jitter.is_nan() {
            return 0.0;
        }
        self.jitter.clamp(0.0, 0.99)
    }
}
