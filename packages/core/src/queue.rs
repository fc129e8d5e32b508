//! Per-queue configuration and statistics.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{duration_ms, BreakerConfig, RateLimitConfig};
use crate::{BackoffPolicy, ConfigError, QueueName};

/// Configuration for one queue and the workers serving it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Number of concurrent workers for this queue.
    pub workers: u32,
    /// How long a dequeued job stays leased before the reaper reclaims it.
    #[serde(with = "duration_ms")]
    pub lease_duration: Duration,
    /// Upper bound on a single client call.
    #[serde(with = "duration_ms")]
    pub call_timeout: Duration,
    /// First idle poll delay; doubles while the queue stays empty.
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// Ceiling for the idle poll delay.
    #[serde(with = "duration_ms")]
    pub max_idle_backoff: Duration,
    /// Attempt budget for jobs enqueued without one.
    pub default_max_attempts: u32,
    /// Delay applied when the breaker is open or the rate limiter times out.
    #[serde(with = "duration_ms")]
    pub cooldown: Duration,
    /// Retry delay policy.
    pub backoff: BackoffPolicy,
    /// Token bucket for the destination, if it is rate limited.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,
    /// Circuit breaker for the destination, if it is guarded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<BreakerConfig>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            lease_duration: Duration::from_secs(120),
            call_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(250),
            max_idle_backoff: Duration::from_secs(5),
            default_max_attempts: 5,
            cooldown: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
            rate_limit: None,
            circuit_breaker: None,
        }
    }
}

impl QueueConfig {
    /// Production defaults for a queue.
    pub fn for_queue(queue: QueueName) -> Self {
        match queue {
            QueueName::Jira => Self {
                rate_limit: Some(RateLimitConfig::new(10, 5.0)),
                circuit_breaker: Some(BreakerConfig::default()),
                ..Self::default()
            },
            QueueName::Slack => Self {
                workers: 2,
                rate_limit: Some(RateLimitConfig::new(3, 1.0)),
                circuit_breaker: Some(BreakerConfig::default()),
                ..Self::default()
            },
            QueueName::Metrics => Self {
                workers: 1,
                default_max_attempts: 3,
                ..Self::default()
            },
        }
    }

    pub fn with_workers(mut self, workers: u32) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll: Duration, max_idle: Duration) -> Self {
        self.poll_interval = poll;
        self.max_idle_backoff = max_idle;
        self
    }

    pub fn with_default_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: Option<RateLimitConfig>) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_circuit_breaker(mut self, breaker: Option<BreakerConfig>) -> Self {
        self.circuit_breaker = breaker;
        self
    }

    /// Idle poll delay after `idle_polls` consecutive empty dequeues.
    pub fn idle_delay(&self, idle_polls: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(idle_polls.min(16));
        self.poll_interval
            .saturating_mul(multiplier)
            .min(self.max_idle_backoff.max(self.poll_interval))
    }

    /// Check invariants the runtime relies on.
    pub fn validate(&self, queue: QueueName) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::Invalid {
            queue,
            reason: reason.to_string(),
        };

        if self.lease_duration <= self.call_timeout {
            return Err(invalid("lease_duration must exceed call_timeout"));
        }
        // A worker holds its lease through the limiter wait and the call.
        if let Some(limit) = &self.rate_limit
            && self.lease_duration <= self.call_timeout.saturating_add(limit.max_wait)
        {
            return Err(invalid("lease_duration must exceed call_timeout plus rate_limit max_wait"));
        }
        if self.poll_interval.is_zero() {
            return Err(invalid("poll_interval must be positive"));
        }
        if self.default_max_attempts == 0 {
            return Err(invalid("default_max_attempts must be at least 1"));
        }
        if self.backoff.base_delay > self.backoff.max_delay {
            return Err(invalid("backoff base_delay exceeds max_delay"));
        }
        if let Some(limit) = &self.rate_limit {
            if limit.capacity == 0 {
                return Err(invalid("rate_limit capacity must be at least 1"));
            }
            if !(limit.refill_per_sec > 0.0) {
                return Err(invalid("rate_limit refill_per_sec must be positive"));
            }
        }
        if let Some(breaker) = &self.circuit_breaker
            && breaker.failure_threshold == 0
        {
            return Err(invalid("circuit_breaker failure_threshold must be at least 1"));
        }
        Ok(())
    }
}

/// Point-in-time view of one queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub queue: QueueName,
    /// Eligible now.
    pub ready: u64,
    /// Waiting for `not_before`.
    pub delayed: u64,
    /// Leased by a worker.
    pub in_flight: u64,
    /// Leased with an expired lease, waiting for the reaper.
    pub expired_leases: u64,
    pub acked: u64,
    pub retried: u64,
    pub deferred: u64,
    pub reaped: u64,
    /// Dead letters recorded for this queue, including before the last restart.
    pub dead_letters: u64,
    pub taken_at: DateTime<Utc>,
}

impl QueueSnapshot {
    /// Jobs waiting in the queue, ready or delayed.
    pub fn depth(&self) -> u64 {
        self.ready + self.delayed
    }

    /// Jobs the queue still owns.
    pub fn active(&self) -> u64 {
        self.depth() + self.in_flight
    }
}
