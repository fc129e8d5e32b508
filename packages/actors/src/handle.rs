//! Producer and operator entry point to a running dispatch system.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use db::JobStore;
use dispatch_core::{
    DeadLetter, DispatchConfig, Job, JobEvent, JobId, QueueError, QueueName, SystemSnapshot,
};
use futures_util::future::join_all;
use ractor::{Actor, ActorRef};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::breaker::CircuitBreaker;
use crate::client::ClientRegistry;
use crate::messages::{DispatchError, QueueMessage, SupervisorMessage, ask};
use crate::rate_limiter::RateLimiter;
use crate::supervisor::{Supervisor, SupervisorArgs};

/// Cheap-to-clone handle to the supervisor and its queues.
#[derive(Clone)]
pub struct DispatchHandle {
    supervisor: ActorRef<SupervisorMessage>,
    queues: Arc<HashMap<QueueName, ActorRef<QueueMessage>>>,
    breakers: Arc<HashMap<QueueName, Arc<CircuitBreaker>>>,
    limiters: Arc<HashMap<QueueName, Arc<RateLimiter>>>,
    default_attempts: Arc<HashMap<QueueName, u32>>,
    event_tx: broadcast::Sender<JobEvent>,
    rpc_timeout: Duration,
}

/// Validate `config` and start the supervisor with its queues, workers and
/// scheduler.
///
/// Workers are started only for queues that have a client in `clients`.
pub async fn start(
    config: DispatchConfig,
    clients: ClientRegistry,
    store: Arc<dyn JobStore>,
) -> Result<(DispatchHandle, JoinHandle<()>), DispatchError> {
    config.validate()?;
    let rpc_timeout = config.rpc_timeout;
    let default_attempts = QueueName::ALL
        .into_iter()
        .map(|queue| (queue, config.queue(queue).default_max_attempts))
        .collect();

    let args = SupervisorArgs {
        config,
        clients,
        store,
    };
    let (supervisor, join_handle) = Actor::spawn(None, Supervisor, args).await?;
    let topology = ask(
        &supervisor,
        |reply| SupervisorMessage::GetTopology { reply },
        rpc_timeout,
    )
    .await?;

    let handle = DispatchHandle {
        supervisor,
        queues: Arc::new(topology.queues),
        breakers: Arc::new(topology.breakers),
        limiters: Arc::new(topology.limiters),
        default_attempts: Arc::new(default_attempts),
        event_tx: topology.event_tx,
        rpc_timeout,
    };
    Ok((handle, join_handle))
}

impl DispatchHandle {
    fn queue_ref(&self, queue: QueueName) -> Result<&ActorRef<QueueMessage>, DispatchError> {
        self.queues
            .get(&queue)
            .ok_or(DispatchError::Queue(QueueError::QueueNotFound(queue)))
    }

    /// Enqueue a payload. `max_attempts` falls back to the queue's default.
    pub async fn enqueue(
        &self,
        queue: QueueName,
        payload: serde_json::Value,
        max_attempts: Option<u32>,
    ) -> Result<JobId, DispatchError> {
        let max_attempts = max_attempts
            .or_else(|| self.default_attempts.get(&queue).copied())
            .unwrap_or(Job::DEFAULT_MAX_ATTEMPTS);
        self.enqueue_job(Job::new(queue, payload).with_max_attempts(max_attempts))
            .await
    }

    /// Enqueue a prepared job (delayed start, idempotency key).
    pub async fn enqueue_job(&self, job: Job) -> Result<JobId, DispatchError> {
        let queue_ref = self.queue_ref(job.queue)?;
        let job_id = ask(
            queue_ref,
            |reply| QueueMessage::Enqueue {
                job: Box::new(job),
                reply,
            },
            self.rpc_timeout,
        )
        .await??;
        Ok(job_id)
    }

    /// Find a live (not yet acked or dead) job in any queue.
    pub async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, DispatchError> {
        for queue_ref in self.queues.values() {
            let found = ask(
                queue_ref,
                |reply| QueueMessage::GetJob { job_id, reply },
                self.rpc_timeout,
            )
            .await?;
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }

    /// Most recent dead letters, of one queue or all of them.
    pub async fn dead_letters(
        &self,
        queue: Option<QueueName>,
        limit: usize,
    ) -> Result<Vec<DeadLetter>, DispatchError> {
        let queues: Vec<QueueName> = match queue {
            Some(queue) => vec![queue],
            None => QueueName::ALL.to_vec(),
        };

        let mut dead = Vec::new();
        for queue in queues {
            let queue_ref = self.queue_ref(queue)?;
            let letters = ask(
                queue_ref,
                |reply| QueueMessage::ListDeadLetters { limit, reply },
                self.rpc_timeout,
            )
            .await??;
            dead.extend(letters);
        }
        dead.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));
        dead.truncate(limit);
        Ok(dead)
    }

    /// Point-in-time view of every queue, breaker and limiter.
    pub async fn snapshot(&self) -> Result<SystemSnapshot, DispatchError> {
        let replies = join_all(QueueName::ALL.into_iter().map(|queue| async move {
            let queue_ref = self.queue_ref(queue)?;
            ask(
                queue_ref,
                |reply| QueueMessage::GetSnapshot { reply },
                self.rpc_timeout,
            )
            .await
        }))
        .await;
        let queues = replies.into_iter().collect::<Result<Vec<_>, _>>()?;

        let breakers = QueueName::ALL
            .into_iter()
            .filter_map(|queue| self.breakers.get(&queue))
            .map(|breaker| breaker.snapshot())
            .collect();
        let limiters = QueueName::ALL
            .into_iter()
            .filter_map(|queue| self.limiters.get(&queue))
            .map(|limiter| limiter.snapshot())
            .collect();

        Ok(SystemSnapshot {
            queues,
            breakers,
            limiters,
            taken_at: Utc::now(),
        })
    }

    /// Receive events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.event_tx.subscribe()
    }

    /// The circuit breaker in front of a destination, if it has one.
    pub fn breaker(&self, destination: QueueName) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(&destination).cloned()
    }

    /// The rate limiter in front of a destination, if it has one.
    pub fn limiter(&self, destination: QueueName) -> Option<Arc<RateLimiter>> {
        self.limiters.get(&destination).cloned()
    }

    /// Reap expired leases on every queue without waiting for the next tick.
    pub async fn reap_now(&self) -> Result<usize, DispatchError> {
        ask(
            &self.supervisor,
            |reply| SupervisorMessage::ReapNow { reply },
            self.rpc_timeout,
        )
        .await
    }

    /// Stop workers, scheduler and queues, then the supervisor.
    ///
    /// Blocking waits are cancelled; a worker in the middle of a call abandons
    /// it and leaves the lease for the reaper of the next run.
    pub async fn shutdown(&self) -> Result<(), DispatchError> {
        ask(
            &self.supervisor,
            |reply| SupervisorMessage::Shutdown { reply },
            self.rpc_timeout.saturating_mul(4),
        )
        .await
    }
}
