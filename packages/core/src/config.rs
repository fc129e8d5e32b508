//! Top-level dispatch configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, QueueConfig, QueueName, ScheduleConfig};

/// Token bucket settings for a destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Maximum burst size.
    pub capacity: u32,
    /// Tokens added per second.
    pub refill_per_sec: f64,
    /// Longest a worker waits for tokens before deferring the job.
    #[serde(with = "duration_ms")]
    pub max_wait: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            refill_per_sec: 5.0,
            max_wait: Duration::from_secs(10),
        }
    }
}

impl RateLimitConfig {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
            ..Self::default()
        }
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }
}

/// Circuit breaker settings for a destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures inside `window` that open the circuit.
    pub failure_threshold: u32,
    /// Failures older than this no longer count.
    #[serde(with = "duration_ms")]
    pub window: Duration,
    /// How long the circuit stays open before admitting a trial call.
    #[serde(with = "duration_ms")]
    pub open_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            open_timeout: Duration::from_secs(30),
        }
    }
}

impl BreakerConfig {
    pub fn new(failure_threshold: u32, open_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            open_timeout,
            ..Self::default()
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }
}

/// Configuration for the whole dispatch system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub jira: QueueConfig,
    pub slack: QueueConfig,
    pub metrics: QueueConfig,
    /// How often expired leases are reclaimed.
    #[serde(with = "duration_ms")]
    pub reap_interval: Duration,
    /// How long an idempotency key blocks duplicate enqueues.
    #[serde(with = "duration_ms")]
    pub dedupe_window: Duration,
    /// How often the scheduler checks its cadences.
    #[serde(with = "duration_ms")]
    pub scheduler_tick: Duration,
    /// Timeout for request/reply messages between actors.
    #[serde(with = "duration_ms")]
    pub rpc_timeout: Duration,
    /// Periodic jobs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub schedules: Vec<ScheduleConfig>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            jira: QueueConfig::for_queue(QueueName::Jira),
            slack: QueueConfig::for_queue(QueueName::Slack),
            metrics: QueueConfig::for_queue(QueueName::Metrics),
            reap_interval: Duration::from_secs(30),
            dedupe_window: Duration::from_secs(24 * 60 * 60),
            scheduler_tick: Duration::from_secs(1),
            rpc_timeout: Duration::from_secs(5),
            schedules: Vec::new(),
        }
    }
}

impl DispatchConfig {
    pub fn queue(&self, queue: QueueName) -> &QueueConfig {
        match queue {
            QueueName::Jira => &self.jira,
            QueueName::Slack => &self.slack,
            QueueName::Metrics => &self.metrics,
        }
    }

    pub fn queue_mut(&mut self, queue: QueueName) -> &mut QueueConfig {
        match queue {
            QueueName::Jira => &mut self.jira,
            QueueName::Slack => &mut self.slack,
            QueueName::Metrics => &mut self.metrics,
        }
    }

    /// Replace one queue's configuration.
    pub fn with_queue(mut self, queue: QueueName, config: QueueConfig) -> Self {
        *self.queue_mut(queue) = config;
        self
    }

    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    pub fn with_schedule(mut self, schedule: ScheduleConfig) -> Self {
        self.schedules.push(schedule);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for queue in QueueName::ALL {
            self.queue(queue).validate(queue)?;
        }
        for schedule in &self.schedules {
            schedule.validate()?;
        }
        Ok(())
    }
}

/// Serde helper for serializing Duration as milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis().try_into().unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
