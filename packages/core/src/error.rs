//! Error types shared by producers and the queue.

use thiserror::Error;

use crate::{JobId, QueueName};

/// Errors returned by queue operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The backing store could not persist the operation; the caller should
    /// retry later or shed load.
    #[error("Job store unavailable: {0}")]
    StoreUnavailable(String),

    /// The job is not in flight under this id (already acked, finalized or
    /// reaped).
    #[error("Unknown job: {0}")]
    UnknownJob(JobId),

    /// No queue actor is running for this queue.
    #[error("Queue not running: {0}")]
    QueueNotFound(QueueName),

    #[error("Unknown queue name: {0}")]
    UnknownQueue(String),
}

/// Invalid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{queue}: {reason}")]
    Invalid { queue: QueueName, reason: String },

    #[error("Schedule '{name}': {reason}")]
    Schedule { name: String, reason: String },
}
