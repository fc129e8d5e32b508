//! Core domain types for the deployment notification dispatcher.
//!
//! This crate contains shared types used across all packages:
//! - Job, Lease and DeadLetter for work items
//! - Queue, limiter, breaker and schedule configuration
//! - Snapshots and events for observability

mod backoff;
mod config;
mod dead_letter;
mod error;
mod events;
mod job;
mod queue;
mod schedule;
mod snapshot;

pub use backoff::BackoffPolicy;
pub use config::{BreakerConfig, DispatchConfig, RateLimitConfig};
pub use dead_letter::{DeadLetter, DeadLetterReason};
pub use error::{ConfigError, QueueError};
pub use events::JobEvent;
pub use job::{CallResponse, Job, JobId, Lease, QueueName};
pub use queue::{QueueConfig, QueueSnapshot};
pub use schedule::{Cadence, ScheduleConfig};
pub use snapshot::{BreakerSnapshot, CircuitState, LimiterSnapshot, SystemSnapshot};
