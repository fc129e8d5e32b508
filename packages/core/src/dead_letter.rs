//! Terminal records for jobs that will never be retried.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Job;

/// Why a job ended up dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// The attempt budget ran out on retryable failures.
    Exhausted,
    /// The destination rejected the payload; retrying cannot help.
    NonRetryable,
}

impl std::fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeadLetterReason::Exhausted => write!(f, "exhausted"),
            DeadLetterReason::NonRetryable => write!(f, "non_retryable"),
        }
    }
}

/// Read-only snapshot of a failed job. Created once per job id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub job: Job,
    pub final_error: String,
    pub reason: DeadLetterReason,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Snapshot `job` as dead. The lease is dropped from the snapshot.
    pub fn new(
        mut job: Job,
        final_error: impl Into<String>,
        reason: DeadLetterReason,
        failed_at: DateTime<Utc>,
    ) -> Self {
        let final_error = final_error.into();
        job.lease = None;
        job.last_error = Some(final_error.clone());
        job.updated_at = failed_at;
        Self {
            job,
            final_error,
            reason,
            failed_at,
        }
    }
}
