//! Actor system for deployment notification dispatch.
//!
//! This crate provides the Ractor-based runtime that moves jobs from the
//! durable queues to their destinations.
//!
//! # Architecture
//!
//! - `Supervisor` - Top-level actor that owns everything below and restarts
//!   failed workers
//! - `QueueActor` - Owns a single queue's jobs, leases and dead letters
//! - `WorkerActor` - Leases jobs and delivers them through the destination's
//!   rate limiter and circuit breaker
//! - `SchedulerActor` - Enqueues periodic jobs with slot idempotency keys
//!
//! # Usage
//!
//! ```ignore
//! use actors::{ClientRegistry, start};
//!
//! let clients = ClientRegistry::new().with(my_slack_client);
//! let (dispatch, _join) = start(DispatchConfig::default(), clients, Arc::new(store)).await?;
//! let job_id = dispatch.enqueue(QueueName::Slack, payload, None).await?;
//! ```

mod breaker;
mod client;
mod handle;
mod messages;
mod queue_actor;
mod rate_limiter;
mod scheduler;
mod supervisor;
mod worker_actor;

pub use breaker::{CircuitBreaker, CircuitOpen, Permit};
pub use client::{CallFuture, CallResult, Client, ClientError, ClientRegistry, FnClient};
pub use handle::{DispatchHandle, start};
pub use messages::{
    DispatchError, QueueMessage, RetryOutcome, SchedulerMessage, SupervisorMessage, Topology,
    WorkerMessage,
};
pub use queue_actor::{QueueActor, QueueActorState};
pub use rate_limiter::{AcquireError, RateLimiter};
pub use scheduler::{SchedulerActor, SchedulerArgs, SchedulerState};
pub use supervisor::{Supervisor, SupervisorArgs};
pub use worker_actor::{Destination, Disposition, WorkerActor, WorkerArgs, process_job};

/// Re-export ractor types for convenience.
pub use ractor::{Actor, ActorRef, RpcReplyPort};
