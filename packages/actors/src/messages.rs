//! Message types for actor communication.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dispatch_core::{ConfigError, DeadLetter, Job, JobEvent, JobId, QueueError, QueueName, QueueSnapshot};
use ractor::rpc::CallResult;
use ractor::{ActorRef, RpcReplyPort};
use tokio::sync::broadcast;

use crate::breaker::CircuitBreaker;
use crate::rate_limiter::RateLimiter;

/// Result of a `Retry` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// The job is eligible again at this time.
    Scheduled { not_before: DateTime<Utc>, attempt: u32 },
    /// The attempt budget is spent; the job is now a dead letter.
    DeadLettered { attempt: u32 },
}

/// Messages for the QueueActor.
#[derive(Debug)]
pub enum QueueMessage {
    /// Persist and enqueue a job. Replies with the id of the stored job, which
    /// is an earlier job's id when the idempotency key is already taken.
    Enqueue {
        job: Box<Job>,
        reply: RpcReplyPort<Result<JobId, QueueError>>,
    },

    /// Lease the oldest eligible job, if any.
    Dequeue {
        worker_id: String,
        lease_duration: Duration,
        reply: RpcReplyPort<Option<Job>>,
    },

    /// Remove a finished job. Every report names the worker holding the
    /// lease; a report from anyone else is answered with `UnknownJob`.
    Ack {
        job_id: JobId,
        worker_id: String,
        reply: RpcReplyPort<Result<(), QueueError>>,
    },

    /// Count a failed attempt and schedule the next one.
    Retry {
        job_id: JobId,
        worker_id: String,
        delay: Duration,
        error: String,
        reply: RpcReplyPort<Result<RetryOutcome, QueueError>>,
    },

    /// Put a leased job back without spending an attempt.
    Defer {
        job_id: JobId,
        worker_id: String,
        delay: Duration,
        reason: String,
        reply: RpcReplyPort<Result<DateTime<Utc>, QueueError>>,
    },

    /// Fail a leased job permanently.
    DeadLetter {
        job_id: JobId,
        worker_id: String,
        error: String,
        reply: RpcReplyPort<Result<(), QueueError>>,
    },

    /// Return expired leases to the queue. Replies with how many were reaped.
    ReapExpiredLeases { reply: Option<RpcReplyPort<usize>> },

    /// Look up a live job.
    GetJob {
        job_id: JobId,
        reply: RpcReplyPort<Option<Job>>,
    },

    /// Most recent dead letters of this queue.
    ListDeadLetters {
        limit: usize,
        reply: RpcReplyPort<Result<Vec<DeadLetter>, QueueError>>,
    },

    /// Depth and counters.
    GetSnapshot { reply: RpcReplyPort<QueueSnapshot> },
}

/// Messages for the WorkerActor.
#[derive(Debug)]
pub enum WorkerMessage {
    /// Try to take and process one job.
    Poll,
}

/// Messages for the SchedulerActor.
#[derive(Debug)]
pub enum SchedulerMessage {
    /// Fire every schedule that is due.
    Tick,
}

/// Everything a [`DispatchHandle`](crate::DispatchHandle) needs to talk to a
/// running system.
#[derive(Debug, Clone)]
pub struct Topology {
    pub queues: HashMap<QueueName, ActorRef<QueueMessage>>,
    pub breakers: HashMap<QueueName, Arc<CircuitBreaker>>,
    pub limiters: HashMap<QueueName, Arc<RateLimiter>>,
    pub event_tx: broadcast::Sender<JobEvent>,
}

/// Messages for the Supervisor.
#[derive(Debug)]
pub enum SupervisorMessage {
    /// Hand out references to the running actors and shared gates.
    GetTopology { reply: RpcReplyPort<Topology> },

    /// Reap expired leases on every queue now.
    ReapNow { reply: RpcReplyPort<usize> },

    /// Stop workers, scheduler and queues, then the supervisor itself.
    Shutdown { reply: RpcReplyPort<()> },

    /// Periodic reaper tick.
    Tick,
}

/// Error type for dispatch operations.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Actor error: {0}")]
    Actor(String),

    #[error("Failed to spawn actor: {0}")]
    Spawn(#[from] ractor::SpawnErr),

    #[error("Timeout")]
    Timeout,
}

/// Request/reply to an actor, flattening ractor's call result.
pub(crate) async fn ask<M, T, F>(
    actor: &ActorRef<M>,
    build: F,
    timeout: Duration,
) -> Result<T, DispatchError>
where
    M: ractor::Message,
    T: Send + 'static,
    F: FnOnce(RpcReplyPort<T>) -> M,
{
    match ractor::rpc::call(actor, build, Some(timeout)).await {
        Ok(CallResult::Success(value)) => Ok(value),
        Ok(CallResult::Timeout) => Err(DispatchError::Timeout),
        Ok(CallResult::SenderError) => Err(DispatchError::Actor("reply port dropped".into())),
        Err(e) => Err(DispatchError::Actor(e.to_string())),
    }
}
