//! Pull-based observability snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{QueueName, QueueSnapshot};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally; failures are counted.
    Closed,
    /// Calls are refused without reaching the destination.
    Open,
    /// One trial call is allowed through.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub destination: QueueName,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub trial_in_flight: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterSnapshot {
    pub destination: QueueName,
    pub available_tokens: f64,
    pub capacity: u32,
}

/// Everything the monitoring collaborator pulls in one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub queues: Vec<QueueSnapshot>,
    pub breakers: Vec<BreakerSnapshot>,
    pub limiters: Vec<LimiterSnapshot>,
    pub taken_at: DateTime<Utc>,
}

impl SystemSnapshot {
    pub fn queue(&self, queue: QueueName) -> Option<&QueueSnapshot> {
        self.queues.iter().find(|q| q.queue == queue)
    }

    pub fn breaker(&self, destination: QueueName) -> Option<&BreakerSnapshot> {
        self.breakers.iter().find(|b| b.destination == destination)
    }

    pub fn limiter(&self, destination: QueueName) -> Option<&LimiterSnapshot> {
        self.limiters.iter().find(|l| l.destination == destination)
    }

    /// Dead letters across all queues.
    pub fn dead_letters(&self) -> u64 {
        self.queues.iter().map(|q| q.dead_letters).sum()
    }
}
