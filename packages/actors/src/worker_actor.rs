//! Worker actor delivering jobs from one queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dispatch_core::{Job, JobEvent, QueueConfig, QueueError, QueueName};
use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::breaker::CircuitBreaker;
use crate::client::{Client, ClientError};
use crate::messages::{DispatchError, QueueMessage, RetryOutcome, WorkerMessage, ask};
use crate::rate_limiter::{AcquireError, RateLimiter};

/// What to tell the queue about a processed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Spend an attempt and try again after `delay`.
    Retry { delay: Duration, error: String },
    /// Put the job back without spending an attempt.
    Defer { delay: Duration, reason: String },
    DeadLetter { error: String },
    /// Walk away; the lease expires and the reaper returns the job.
    Abandon,
}

/// The client and the shared gates in front of one destination.
#[derive(Clone)]
pub struct Destination {
    pub client: Arc<dyn Client>,
    pub limiter: Option<Arc<RateLimiter>>,
    pub breaker: Option<Arc<CircuitBreaker>>,
}

/// Run one leased job through the limiter, the breaker and the client.
pub async fn process_job(
    job: &Job,
    destination: &Destination,
    config: &QueueConfig,
    cancel: &CancellationToken,
) -> Disposition {
    if let Some(limiter) = &destination.limiter {
        match limiter.acquire(1, true, cancel).await {
            Ok(()) => {}
            Err(AcquireError::Timeout) => {
                return Disposition::Defer {
                    delay: config.cooldown,
                    reason: AcquireError::Timeout.to_string(),
                };
            }
            Err(AcquireError::Cancelled) => {
                return Disposition::Defer {
                    delay: Duration::ZERO,
                    reason: AcquireError::Cancelled.to_string(),
                };
            }
        }
    }

    let permit = match &destination.breaker {
        Some(breaker) => match breaker.allow() {
            Ok(permit) => Some(permit),
            Err(open) => {
                return Disposition::Defer {
                    delay: config.cooldown,
                    reason: open.to_string(),
                };
            }
        },
        None => None,
    };

    let outcome = tokio::select! {
        biased;
        // Dropping an unresolved permit frees a half-open trial slot.
        _ = cancel.cancelled() => return Disposition::Abandon,
        outcome = tokio::time::timeout(config.call_timeout, destination.client.call(job)) => outcome,
    };

    match outcome {
        Ok(Ok(response)) => {
            if let Some(permit) = permit {
                permit.success();
            }
            tracing::debug!(job_id = %job.id, "Delivered: {}", response.summary);
            Disposition::Ack
        }
        Ok(Err(ClientError::NonRetryable(error))) => {
            if let Some(permit) = permit {
                permit.failure();
            }
            Disposition::DeadLetter { error }
        }
        Ok(Err(ClientError::Retryable(error))) => {
            if let Some(permit) = permit {
                permit.failure();
            }
            Disposition::Retry {
                delay: config.backoff.delay_for(job.attempt),
                error,
            }
        }
        Err(_) => {
            if let Some(permit) = permit {
                permit.failure();
            }
            Disposition::Retry {
                delay: config.backoff.delay_for(job.attempt),
                error: format!("call timed out after {}ms", config.call_timeout.as_millis()),
            }
        }
    }
}

/// Worker actor arguments.
pub struct WorkerArgs {
    pub worker_id: String,
    pub queue: QueueName,
    pub queue_ref: ActorRef<QueueMessage>,
    pub config: QueueConfig,
    pub destination: Destination,
    pub cancel: CancellationToken,
    pub rpc_timeout: Duration,
    pub event_tx: Option<broadcast::Sender<JobEvent>>,
}

/// State for the worker actor.
pub struct WorkerActorState {
    args: WorkerArgs,
    /// Consecutive empty dequeues.
    idle_polls: u32,
}

impl WorkerActorState {
    fn broadcast(&self, event: JobEvent) {
        if let Some(ref tx) = self.args.event_tx {
            let _ = tx.send(event);
        }
    }

    async fn dequeue(&self) -> Result<Option<Job>, DispatchError> {
        let args = &self.args;
        ask(
            &args.queue_ref,
            |reply| QueueMessage::Dequeue {
                worker_id: args.worker_id.clone(),
                lease_duration: args.config.lease_duration,
                reply,
            },
            args.rpc_timeout,
        )
        .await
    }

    /// Tell the queue what happened to `job`.
    async fn report(&self, job: &Job, disposition: Disposition) -> Result<(), DispatchError> {
        let args = &self.args;
        let job_id = job.id;
        let worker_id = args.worker_id.clone();
        let result = match disposition {
            Disposition::Ack => {
                ask(
                    &args.queue_ref,
                    |reply| QueueMessage::Ack {
                        job_id,
                        worker_id,
                        reply,
                    },
                    args.rpc_timeout,
                )
                .await?
            }
            Disposition::Retry { delay, error } => {
                let outcome = ask(
                    &args.queue_ref,
                    |reply| QueueMessage::Retry {
                        job_id,
                        worker_id,
                        delay,
                        error,
                        reply,
                    },
                    args.rpc_timeout,
                )
                .await?;
                outcome.map(|outcome| {
                    if let RetryOutcome::DeadLettered { attempt } = outcome {
                        tracing::debug!(%job_id, attempt, "Attempts exhausted");
                    }
                })
            }
            Disposition::Defer { delay, reason } => ask(
                &args.queue_ref,
                |reply| QueueMessage::Defer {
                    job_id,
                    worker_id,
                    delay,
                    reason,
                    reply,
                },
                args.rpc_timeout,
            )
            .await?
            .map(|_| ()),
            Disposition::DeadLetter { error } => {
                ask(
                    &args.queue_ref,
                    |reply| QueueMessage::DeadLetter {
                        job_id,
                        worker_id,
                        error,
                        reply,
                    },
                    args.rpc_timeout,
                )
                .await?
            }
            Disposition::Abandon => {
                tracing::info!(worker = %args.worker_id, %job_id, "Abandoned job on shutdown");
                Ok(())
            }
        };

        match result {
            Ok(()) => Ok(()),
            // The lease expired and the job moved on without us.
            Err(QueueError::UnknownJob(job_id)) => {
                tracing::warn!(worker = %args.worker_id, %job_id, "Job no longer leased by this worker");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Sleep for `delay` then poll again, unless shutdown comes first.
fn schedule_poll(myself: ActorRef<WorkerMessage>, delay: Duration, cancel: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => {
                let _ = myself.send_message(WorkerMessage::Poll);
            }
        }
    });
}

/// Worker actor that leases and delivers jobs.
pub struct WorkerActor;

impl Actor for WorkerActor {
    type Msg = WorkerMessage;
    type State = WorkerActorState;
    type Arguments = WorkerArgs;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting worker: {}", args.worker_id);
        Ok(WorkerActorState { args, idle_polls: 0 })
    }

    async fn post_start(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        state.broadcast(JobEvent::WorkerStarted {
            worker_id: state.args.worker_id.clone(),
            queue: state.args.queue,
            timestamp: Utc::now(),
        });
        myself.send_message(WorkerMessage::Poll)?;
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            WorkerMessage::Poll => {
                if state.args.cancel.is_cancelled() {
                    return Ok(());
                }

                let job = match state.dequeue().await {
                    Ok(job) => job,
                    Err(e) => {
                        tracing::warn!(worker = %state.args.worker_id, "Dequeue failed: {}", e);
                        None
                    }
                };

                let Some(job) = job else {
                    let delay = state.args.config.idle_delay(state.idle_polls);
                    state.idle_polls = state.idle_polls.saturating_add(1);
                    schedule_poll(myself, delay, state.args.cancel.clone());
                    return Ok(());
                };
                state.idle_polls = 0;

                let disposition = process_job(
                    &job,
                    &state.args.destination,
                    &state.args.config,
                    &state.args.cancel,
                )
                .await;
                tracing::debug!(
                    worker = %state.args.worker_id,
                    job_id = %job.id,
                    attempt = job.attempt,
                    ?disposition,
                    "Processed job"
                );

                if let Err(e) = state.report(&job, disposition).await {
                    // The lease will expire and the reaper returns the job.
                    tracing::warn!(worker = %state.args.worker_id, job_id = %job.id, "Report failed: {}", e);
                }

                if !state.args.cancel.is_cancelled() {
                    myself.send_message(WorkerMessage::Poll)?;
                }
            }
        }

        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        tracing::info!("Worker stopped: {}", state.args.worker_id);
        state.broadcast(JobEvent::WorkerStopped {
            worker_id: state.args.worker_id.clone(),
            queue: state.args.queue,
            timestamp: Utc::now(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{CallFuture, FnClient};
    use dispatch_core::{BackoffPolicy, BreakerConfig, CallResponse, RateLimitConfig};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config() -> QueueConfig {
        QueueConfig::default()
            .with_call_timeout(Duration::from_secs(1))
            .with_cooldown(Duration::from_secs(30))
            .with_backoff(BackoffPolicy::new(Duration::from_secs(2), Duration::from_secs(60)).with_jitter(0.0))
    }

    fn destination(
        calls: Arc<AtomicU32>,
        result: fn(u32) -> Result<CallResponse, ClientError>,
    ) -> Destination {
        let client = FnClient::new(QueueName::Slack, move |_job: Job| -> CallFuture<'static> {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { result(n) })
        });
        Destination {
            client: Arc::new(client),
            limiter: None,
            breaker: None,
        }
    }

    fn job() -> Job {
        Job::new(QueueName::Slack, json!({"text": "deployed api"}))
    }

    #[tokio::test(start_paused = true)]
    async fn outcomes_map_to_dispositions() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let ok = destination(calls.clone(), |_| Ok(CallResponse::new("ok")));
        assert_eq!(process_job(&job(), &ok, &config(), &cancel).await, Disposition::Ack);

        let flaky = destination(calls.clone(), |_| Err(ClientError::retryable("502")));
        let mut retried = job();
        retried.attempt = 2;
        assert_eq!(
            process_job(&retried, &flaky, &config(), &cancel).await,
            Disposition::Retry {
                delay: Duration::from_secs(8),
                error: "502".into()
            }
        );

        let broken = destination(calls.clone(), |_| Err(ClientError::non_retryable("404")));
        assert_eq!(
            process_job(&job(), &broken, &config(), &cancel).await,
            Disposition::DeadLetter { error: "404".into() }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_calls_time_out_as_retryable() {
        let cancel = CancellationToken::new();
        let client = FnClient::new(QueueName::Slack, |_job: Job| -> CallFuture<'static> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(CallResponse::new("late"))
            })
        });
        let destination = Destination {
            client: Arc::new(client),
            limiter: None,
            breaker: None,
        };

        match process_job(&job(), &destination, &config(), &cancel).await {
            Disposition::Retry { delay, error } => {
                assert_eq!(delay, Duration::from_secs(2));
                assert!(error.contains("timed out"));
            }
            other => panic!("unexpected disposition: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_defers_without_calling() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let breaker = Arc::new(CircuitBreaker::new(
            QueueName::Slack,
            BreakerConfig::new(1, Duration::from_secs(60)),
        ));
        let mut destination = destination(calls.clone(), |_| Err(ClientError::retryable("503")));
        destination.breaker = Some(breaker.clone());

        assert!(matches!(
            process_job(&job(), &destination, &config(), &cancel).await,
            Disposition::Retry { .. }
        ));
        match process_job(&job(), &destination, &config(), &cancel).await {
            Disposition::Defer { delay, reason } => {
                assert_eq!(delay, Duration::from_secs(30));
                assert!(reason.contains("Circuit open"));
            }
            other => panic!("unexpected disposition: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn limiter_timeout_and_cancellation_defer() {
        let calls = Arc::new(AtomicU32::new(0));
        let limiter = Arc::new(RateLimiter::new(
            QueueName::Slack,
            &RateLimitConfig::new(1, 0.01).with_max_wait(Duration::from_secs(1)),
        ));
        let mut destination = destination(calls.clone(), |_| Ok(CallResponse::new("ok")));
        destination.limiter = Some(limiter);

        let cancel = CancellationToken::new();
        assert_eq!(process_job(&job(), &destination, &config(), &cancel).await, Disposition::Ack);
        assert_eq!(
            process_job(&job(), &destination, &config(), &cancel).await,
            Disposition::Defer {
                delay: Duration::from_secs(30),
                reason: AcquireError::Timeout.to_string()
            }
        );

        cancel.cancel();
        assert_eq!(
            process_job(&job(), &destination, &config(), &cancel).await,
            Disposition::Defer {
                delay: Duration::ZERO,
                reason: AcquireError::Cancelled.to_string()
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_call_abandons() {
        let cancel = CancellationToken::new();
        let client = FnClient::new(QueueName::Slack, |_job: Job| -> CallFuture<'static> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(CallResponse::new("never"))
            })
        });
        let destination = Destination {
            client: Arc::new(client),
            limiter: None,
            breaker: None,
        };
        let config = config().with_call_timeout(Duration::from_secs(120)).with_lease_duration(Duration::from_secs(180));

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });
        assert_eq!(process_job(&job(), &destination, &config, &cancel).await, Disposition::Abandon);
    }
}
