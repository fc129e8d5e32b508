//! Job domain types for work items in the queue.

use std::cmp::Ordering;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unique identifier for a job, using ULID for chronological sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Ulid);

impl JobId {
    /// Create a new unique job ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a job ID from a string.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The named queues of the dispatch system.
///
/// Each queue doubles as the destination its workers call: `jira` jobs open
/// tickets, `slack` jobs post messages, `metrics` jobs run periodic SLA and
/// cleanup work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueName {
    Jira,
    Slack,
    Metrics,
}

impl QueueName {
    /// Every queue, in a stable order.
    pub const ALL: [QueueName; 3] = [QueueName::Jira, QueueName::Slack, QueueName::Metrics];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Jira => "jira",
            QueueName::Slack => "slack",
            QueueName::Metrics => "metrics",
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = crate::QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "jira" => Ok(QueueName::Jira),
            "slack" => Ok(QueueName::Slack),
            "metrics" => Ok(QueueName::Metrics),
            other => Err(crate::QueueError::UnknownQueue(other.to_string())),
        }
    }
}

/// Exclusive, time-limited claim on a job by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Worker holding the lease.
    pub worker_id: String,
    /// After this instant the reaper may return the job to the queue.
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Response returned by a destination client on success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallResponse {
    /// Human-readable summary of the result.
    pub summary: String,
    /// Optional structured output data as JSON.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
}

impl CallResponse {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            output: None,
        }
    }

    pub fn with_output(summary: impl Into<String>, output: serde_json::Value) -> Self {
        Self {
            summary: summary.into(),
            output: Some(output),
        }
    }
}

/// A job represents one outbound call to be made by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier for this job.
    pub id: JobId,
    /// The queue (and destination) this job belongs to.
    pub queue: QueueName,
    /// Job payload as JSON. Encoding for the destination is owned by the client.
    pub payload: serde_json::Value,
    /// Number of failed attempts so far.
    #[serde(default)]
    pub attempt: u32,
    /// Attempt budget; reaching it dead-letters the job.
    pub max_attempts: u32,
    /// The job is not eligible before this instant.
    pub not_before: DateTime<Utc>,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// When the job was last updated.
    pub updated_at: DateTime<Utc>,
    /// Error from the most recent failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Deduplication key for producers that may fire twice.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Present while a worker holds the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<Lease>,
}

impl Job {
    /// Default attempt budget for new jobs.
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

    /// Create a new job, eligible immediately.
    pub fn new(queue: QueueName, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            queue,
            payload,
            attempt: 0,
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            not_before: now,
            created_at: now,
            updated_at: now,
            last_error: None,
            idempotency_key: None,
            lease: None,
        }
    }

    /// Set the attempt budget. A budget of zero is treated as one.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Attach a deduplication key.
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Delay first eligibility.
    pub fn with_not_before(mut self, not_before: DateTime<Utc>) -> Self {
        self.not_before = not_before;
        self
    }

    /// Whether a worker may dequeue the job at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.lease.is_none() && self.not_before <= now
    }

    /// Whether the next failure exhausts the attempt budget.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt.saturating_add(1) >= self.max_attempts
    }

    /// FIFO ordering key within a queue.
    pub fn fifo_cmp(&self, other: &Job) -> Ordering {
        self.not_before
            .cmp(&other.not_before)
            .then_with(|| self.created_at.cmp(&other.created_at))
            .then_with(|| self.id.cmp(&other.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn new_job_is_eligible_immediately() {
        let job = Job::new(QueueName::Jira, json!({"ticket": "DEP-1"}));
        assert_eq!(job.attempt, 0);
        assert_eq!(job.max_attempts, Job::DEFAULT_MAX_ATTEMPTS);
        assert!(job.is_eligible(job.created_at));
    }

    #[test]
    fn leased_or_delayed_jobs_are_not_eligible() {
        let now = Utc::now();
        let delayed = Job::new(QueueName::Slack, json!({})).with_not_before(now + Duration::seconds(5));
        assert!(!delayed.is_eligible(now));
        assert!(delayed.is_eligible(now + Duration::seconds(5)));

        let mut leased = Job::new(QueueName::Slack, json!({}));
        leased.lease = Some(Lease {
            worker_id: "worker-1".into(),
            expires_at: now + Duration::seconds(30),
        });
        assert!(!leased.is_eligible(now + Duration::seconds(60)));
    }

    #[test]
    fn zero_attempt_budget_is_raised_to_one() {
        let job = Job::new(QueueName::Metrics, json!({})).with_max_attempts(0);
        assert_eq!(job.max_attempts, 1);
        assert!(job.is_last_attempt());
    }

    #[test]
    fn fifo_orders_by_not_before_then_creation() {
        let now = Utc::now();
        let mut first = Job::new(QueueName::Jira, json!({}));
        let mut second = Job::new(QueueName::Jira, json!({}));
        first.created_at = now;
        second.created_at = now + Duration::milliseconds(1);
        first.not_before = now;
        second.not_before = now;
        assert_eq!(first.fifo_cmp(&second), Ordering::Less);

        first.not_before = now + Duration::seconds(1);
        assert_eq!(first.fifo_cmp(&second), Ordering::Greater);
    }

    #[test]
    fn queue_names_parse_case_insensitively() {
        assert_eq!("Slack".parse::<QueueName>().ok(), Some(QueueName::Slack));
        assert!("email".parse::<QueueName>().is_err());
        assert_eq!(QueueName::Metrics.to_string(), "metrics");
    }
}
