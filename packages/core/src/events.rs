//! Event types for real-time updates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CircuitState, DeadLetterReason, Job, JobId, QueueName};

/// Events emitted by the dispatch system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    // Job events
    /// A new job was enqueued.
    JobEnqueued { job: Job, timestamp: DateTime<Utc> },
    /// A worker leased a job.
    JobLeased {
        job_id: JobId,
        queue: QueueName,
        worker_id: String,
        attempt: u32,
        lease_expires_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },
    /// A job was acknowledged and removed.
    JobAcked {
        job_id: JobId,
        queue: QueueName,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    /// A job failed and will run again after `not_before`.
    JobRetryScheduled {
        job_id: JobId,
        queue: QueueName,
        attempt: u32,
        not_before: DateTime<Utc>,
        error: String,
        timestamp: DateTime<Utc>,
    },
    /// A job was returned without spending an attempt.
    JobDeferred {
        job_id: JobId,
        queue: QueueName,
        not_before: DateTime<Utc>,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    /// A job reached its terminal failure state.
    JobDeadLettered {
        job_id: JobId,
        queue: QueueName,
        error: String,
        reason: DeadLetterReason,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    /// The reaper reclaimed an expired lease.
    LeaseExpired {
        job_id: JobId,
        queue: QueueName,
        worker_id: String,
        timestamp: DateTime<Utc>,
    },

    // Destination events
    /// A circuit breaker changed state.
    BreakerStateChanged {
        destination: QueueName,
        from: CircuitState,
        to: CircuitState,
        timestamp: DateTime<Utc>,
    },

    // Scheduler events
    /// A periodic job was enqueued.
    ScheduleFired {
        name: String,
        queue: QueueName,
        job_id: JobId,
        idempotency_key: String,
        timestamp: DateTime<Utc>,
    },

    // Worker events
    /// A worker started serving a queue.
    WorkerStarted {
        worker_id: String,
        queue: QueueName,
        timestamp: DateTime<Utc>,
    },
    /// A worker stopped.
    WorkerStopped {
        worker_id: String,
        queue: QueueName,
        timestamp: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            JobEvent::JobEnqueued { timestamp, .. } => *timestamp,
            JobEvent::JobLeased { timestamp, .. } => *timestamp,
            JobEvent::JobAcked { timestamp, .. } => *timestamp,
            JobEvent::JobRetryScheduled { timestamp, .. } => *timestamp,
            JobEvent::JobDeferred { timestamp, .. } => *timestamp,
            JobEvent::JobDeadLettered { timestamp, .. } => *timestamp,
            JobEvent::LeaseExpired { timestamp, .. } => *timestamp,
            JobEvent::BreakerStateChanged { timestamp, .. } => *timestamp,
            JobEvent::ScheduleFired { timestamp, .. } => *timestamp,
            JobEvent::WorkerStarted { timestamp, .. } => *timestamp,
            JobEvent::WorkerStopped { timestamp, .. } => *timestamp,
        }
    }

    /// Get the queue (or destination) associated with this event.
    pub fn queue(&self) -> QueueName {
        match self {
            JobEvent::JobEnqueued { job, .. } => job.queue,
            JobEvent::JobLeased { queue, .. } => *queue,
            JobEvent::JobAcked { queue, .. } => *queue,
            JobEvent::JobRetryScheduled { queue, .. } => *queue,
            JobEvent::JobDeferred { queue, .. } => *queue,
            JobEvent::JobDeadLettered { queue, .. } => *queue,
            JobEvent::LeaseExpired { queue, .. } => *queue,
            JobEvent::BreakerStateChanged { destination, .. } => *destination,
            JobEvent::ScheduleFired { queue, .. } => *queue,
            JobEvent::WorkerStarted { queue, .. } => *queue,
            JobEvent::WorkerStopped { queue, .. } => *queue,
        }
    }

    /// Get the job ID associated with this event, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            JobEvent::JobEnqueued { job, .. } => Some(job.id),
            JobEvent::JobLeased { job_id, .. } => Some(*job_id),
            JobEvent::JobAcked { job_id, .. } => Some(*job_id),
            JobEvent::JobRetryScheduled { job_id, .. } => Some(*job_id),
            JobEvent::JobDeferred { job_id, .. } => Some(*job_id),
            JobEvent::JobDeadLettered { job_id, .. } => Some(*job_id),
            JobEvent::LeaseExpired { job_id, .. } => Some(*job_id),
            JobEvent::ScheduleFired { job_id, .. } => Some(*job_id),
            _ => None,
        }
    }

    /// Get a short description of this event for logging.
    pub fn description(&self) -> String {
        match self {
            JobEvent::JobEnqueued { job, .. } => format!("Job {} enqueued on {}", job.id, job.queue),
            JobEvent::JobLeased {
                job_id, worker_id, ..
            } => format!("Job {} leased by {}", job_id, worker_id),
            JobEvent::JobAcked { job_id, .. } => format!("Job {} acked", job_id),
            JobEvent::JobRetryScheduled {
                job_id,
                attempt,
                error,
                ..
            } => format!("Job {} failed (attempt {}): {}", job_id, attempt, error),
            JobEvent::JobDeferred { job_id, reason, .. } => {
                format!("Job {} deferred: {}", job_id, reason)
            }
            JobEvent::JobDeadLettered {
                job_id,
                error,
                reason,
                ..
            } => format!("Job {} dead-lettered ({}): {}", job_id, reason, error),
            JobEvent::LeaseExpired {
                job_id, worker_id, ..
            } => format!("Lease on job {} held by {} expired", job_id, worker_id),
            JobEvent::BreakerStateChanged {
                destination,
                from,
                to,
                ..
            } => format!("Circuit {} {} -> {}", destination, from, to),
            JobEvent::ScheduleFired { name, job_id, .. } => {
                format!("Schedule '{}' enqueued job {}", name, job_id)
            }
            JobEvent::WorkerStarted {
                worker_id, queue, ..
            } => format!("Worker {} started on {}", worker_id, queue),
            JobEvent::WorkerStopped {
                worker_id, queue, ..
            } => format!("Worker {} stopped on {}", worker_id, queue),
        }
    }
}
