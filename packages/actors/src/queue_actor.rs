//! Queue actor owning one queue's jobs.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use db::{DbError, JobStore};
use dispatch_core::{
    DeadLetter, DeadLetterReason, Job, JobEvent, JobId, Lease, QueueError, QueueName, QueueSnapshot,
};
use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio::sync::broadcast;

use crate::messages::{QueueMessage, RetryOutcome};

/// Heap entry ordering jobs oldest-first by (not_before, created_at).
#[derive(Debug, Clone)]
struct EligibleJob(Job);

impl PartialEq for EligibleJob {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for EligibleJob {}

impl PartialOrd for EligibleJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EligibleJob {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the oldest job is on top.
        other.0.fifo_cmp(&self.0)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct QueueCounters {
    acked: u64,
    retried: u64,
    deferred: u64,
    reaped: u64,
    dead_letters: u64,
}

fn store_error(err: DbError) -> QueueError {
    QueueError::StoreUnavailable(err.to_string())
}

/// `now + delay`, saturating instead of overflowing.
pub(crate) fn later(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    let delta = TimeDelta::from_std(delay).unwrap_or(TimeDelta::MAX);
    now.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// State for the queue actor.
///
/// Every transition is written to the store first and applied in memory only
/// once the write succeeded, so memory never runs ahead of what a restart
/// would recover.
pub struct QueueActorState {
    queue: QueueName,
    /// Jobs without a lease, eligible now or later.
    eligible: BinaryHeap<EligibleJob>,
    /// Leased jobs by id.
    in_flight: HashMap<JobId, Job>,
    store: Arc<dyn JobStore>,
    event_tx: Option<broadcast::Sender<JobEvent>>,
    dedupe_window: Duration,
    counters: QueueCounters,
}

impl QueueActorState {
    /// Create a new queue actor state.
    pub fn new(queue: QueueName, store: Arc<dyn JobStore>) -> Self {
        Self {
            queue,
            eligible: BinaryHeap::new(),
            in_flight: HashMap::new(),
            store,
            event_tx: None,
            dedupe_window: Duration::from_secs(24 * 60 * 60),
            counters: QueueCounters::default(),
        }
    }

    /// Set the event broadcaster.
    pub fn with_event_tx(mut self, tx: broadcast::Sender<JobEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// How long an idempotency key blocks duplicates.
    pub fn with_dedupe_window(mut self, window: Duration) -> Self {
        self.dedupe_window = window;
        self
    }

    pub fn queue(&self) -> QueueName {
        self.queue
    }

    fn broadcast(&self, event: JobEvent) {
        if let Some(ref tx) = self.event_tx {
            let _ = tx.send(event);
        }
    }

    /// Rebuild memory from the store. Leased jobs keep their original expiry
    /// so the reaper sees leases held before the restart.
    pub async fn recover(&mut self) -> Result<(), DbError> {
        let jobs = self.store.load_jobs(self.queue).await?;
        let mut leased = 0usize;
        for job in jobs {
            if job.lease.is_some() {
                leased += 1;
                self.in_flight.insert(job.id, job);
            } else {
                self.eligible.push(EligibleJob(job));
            }
        }
        self.counters.dead_letters = self.store.count_dead_letters(self.queue).await?;

        tracing::info!(
            queue = %self.queue,
            eligible = self.eligible.len(),
            leased,
            dead_letters = self.counters.dead_letters,
            "Recovered queue from store"
        );
        Ok(())
    }

    /// Persist a new job. With an idempotency key that is still reserved, no
    /// job is created and the holder's id is returned.
    ///
    /// Attempt, lease and timestamps are owned by the queue, so whatever the
    /// caller put there is reset before anything is written.
    pub async fn enqueue(&mut self, mut job: Job, now: DateTime<Utc>) -> Result<JobId, QueueError> {
        job.attempt = 0;
        job.lease = None;
        job.last_error = None;
        job.created_at = now;
        job.updated_at = now;
        job.not_before = job.not_before.max(now);

        // Reserve before inserting so a duplicate never reaches the store.
        let key = job.idempotency_key.clone();
        if let Some(key) = key.as_deref() {
            let expires_at = later(now, self.dedupe_window);
            let holder = self
                .store
                .reserve_key(key, job.id, expires_at, now)
                .await
                .map_err(store_error)?;
            if let Some(holder) = holder {
                tracing::debug!(queue = %self.queue, key, %holder, "Duplicate enqueue absorbed");
                return Ok(holder);
            }
        }

        if let Err(e) = self.store.insert_job(&job).await {
            if let Some(key) = key.as_deref()
                && let Err(release) = self.store.release_key(key, job.id).await
            {
                tracing::warn!("Failed to release key {} for job {}: {}", key, job.id, release);
            }
            return Err(store_error(e));
        }

        let job_id = job.id;
        tracing::debug!(queue = %self.queue, %job_id, max_attempts = job.max_attempts, "Job enqueued");
        self.broadcast(JobEvent::JobEnqueued {
            job: job.clone(),
            timestamp: now,
        });
        self.eligible.push(EligibleJob(job));
        Ok(job_id)
    }

    /// Lease the oldest job that is eligible at `now`.
    pub async fn dequeue(
        &mut self,
        worker_id: &str,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> Option<Job> {
        if !self.eligible.peek()?.0.is_eligible(now) {
            return None;
        }
        let EligibleJob(mut job) = self.eligible.pop()?;

        let expires_at = later(now, lease_duration);
        job.lease = Some(Lease {
            worker_id: worker_id.to_string(),
            expires_at,
        });
        let previous_update = job.updated_at;
        job.updated_at = now;

        if let Err(e) = self.store.save_job(&job).await {
            tracing::warn!("Failed to lease job {}: {}", job.id, e);
            job.lease = None;
            job.updated_at = previous_update;
            self.eligible.push(EligibleJob(job));
            return None;
        }

        self.in_flight.insert(job.id, job.clone());
        self.broadcast(JobEvent::JobLeased {
            job_id: job.id,
            queue: self.queue,
            worker_id: worker_id.to_string(),
            attempt: job.attempt,
            lease_expires_at: expires_at,
            timestamp: now,
        });
        Some(job)
    }

    /// The in-flight job `worker_id` still holds a live lease on.
    fn held_by(&self, job_id: JobId, worker_id: &str, now: DateTime<Utc>) -> Result<&Job, QueueError> {
        self.in_flight
            .get(&job_id)
            .filter(|job| {
                job.lease
                    .as_ref()
                    .is_some_and(|lease| lease.worker_id == worker_id && !lease.is_expired(now))
            })
            .ok_or(QueueError::UnknownJob(job_id))
    }

    /// Remove a finished job for good.
    pub async fn ack(&mut self, job_id: JobId, worker_id: &str, now: DateTime<Utc>) -> Result<(), QueueError> {
        let attempt = self.held_by(job_id, worker_id, now)?.attempt;

        self.store.delete_job(job_id).await.map_err(store_error)?;
        self.in_flight.remove(&job_id);
        self.counters.acked += 1;

        tracing::debug!(queue = %self.queue, %job_id, attempt, "Job acked");
        self.broadcast(JobEvent::JobAcked {
            job_id,
            queue: self.queue,
            attempt,
            timestamp: now,
        });
        Ok(())
    }

    /// Count a failed attempt. Dead-letters the job once the budget is spent.
    pub async fn retry(
        &mut self,
        job_id: JobId,
        worker_id: &str,
        delay: Duration,
        error: String,
        now: DateTime<Utc>,
    ) -> Result<RetryOutcome, QueueError> {
        let mut job = self.held_by(job_id, worker_id, now)?.clone();

        job.attempt = job.attempt.saturating_add(1);
        if job.attempt >= job.max_attempts {
            let attempt = job.attempt;
            self.bury(job, error, DeadLetterReason::Exhausted, now).await?;
            return Ok(RetryOutcome::DeadLettered { attempt });
        }

        let not_before = later(now, delay);
        job.not_before = not_before;
        job.lease = None;
        job.last_error = Some(error.clone());
        job.updated_at = now;
        self.store.save_job(&job).await.map_err(store_error)?;

        let attempt = job.attempt;
        self.in_flight.remove(&job_id);
        self.eligible.push(EligibleJob(job));
        self.counters.retried += 1;

        tracing::info!(
            queue = %self.queue,
            %job_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Retry scheduled: {}",
            error
        );
        self.broadcast(JobEvent::JobRetryScheduled {
            job_id,
            queue: self.queue,
            attempt,
            not_before,
            error,
            timestamp: now,
        });
        Ok(RetryOutcome::Scheduled {
            not_before,
            attempt,
        })
    }

    /// Return a leased job to the queue with its attempt count unchanged.
    pub async fn defer(
        &mut self,
        job_id: JobId,
        worker_id: &str,
        delay: Duration,
        reason: String,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, QueueError> {
        let mut job = self.held_by(job_id, worker_id, now)?.clone();

        let not_before = later(now, delay);
        job.not_before = not_before;
        job.lease = None;
        job.updated_at = now;
        self.store.save_job(&job).await.map_err(store_error)?;

        self.in_flight.remove(&job_id);
        self.eligible.push(EligibleJob(job));
        self.counters.deferred += 1;

        tracing::debug!(queue = %self.queue, %job_id, "Job deferred: {}", reason);
        self.broadcast(JobEvent::JobDeferred {
            job_id,
            queue: self.queue,
            not_before,
            reason,
            timestamp: now,
        });
        Ok(not_before)
    }

    /// Fail a leased job permanently.
    ///
    /// A job is buried at most once: a repeated call finds nothing in flight
    /// and returns `UnknownJob`, and the store keeps the first record.
    pub async fn dead_letter(
        &mut self,
        job_id: JobId,
        worker_id: &str,
        error: String,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let job = self.held_by(job_id, worker_id, now)?.clone();
        self.bury(job, error, DeadLetterReason::NonRetryable, now).await
    }

    async fn bury(
        &mut self,
        job: Job,
        error: String,
        reason: DeadLetterReason,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let job_id = job.id;
        let attempt = job.attempt;
        let dead = DeadLetter::new(job, error.clone(), reason, now);
        let created = self.store.bury(&dead).await.map_err(store_error)?;
        self.in_flight.remove(&job_id);

        if !created {
            tracing::debug!(queue = %self.queue, %job_id, "Dead letter already recorded");
            return Ok(());
        }
        self.counters.dead_letters += 1;

        tracing::error!(
            queue = %self.queue,
            %job_id,
            attempt,
            reason = %reason,
            "Job dead-lettered: {}",
            error
        );
        self.broadcast(JobEvent::JobDeadLettered {
            job_id,
            queue: self.queue,
            error,
            reason,
            attempt,
            timestamp: now,
        });
        Ok(())
    }

    /// Return every expired lease to the queue, attempt unchanged.
    pub async fn reap_expired(&mut self, now: DateTime<Utc>) -> usize {
        let expired: Vec<JobId> = self
            .in_flight
            .values()
            .filter(|job| job.lease.as_ref().is_some_and(|lease| lease.is_expired(now)))
            .map(|job| job.id)
            .collect();

        let mut reaped = 0;
        for job_id in expired {
            let Some(mut job) = self.in_flight.get(&job_id).cloned() else {
                continue;
            };
            let worker_id = job
                .lease
                .take()
                .map(|lease| lease.worker_id)
                .unwrap_or_default();
            job.updated_at = now;

            if let Err(e) = self.store.save_job(&job).await {
                // Still expired on the next sweep.
                tracing::warn!("Failed to reap job {}: {}", job_id, e);
                continue;
            }

            self.in_flight.remove(&job_id);
            self.eligible.push(EligibleJob(job));
            self.counters.reaped += 1;
            reaped += 1;

            tracing::warn!(queue = %self.queue, %job_id, worker_id = %worker_id, "Lease expired");
            self.broadcast(JobEvent::LeaseExpired {
                job_id,
                queue: self.queue,
                worker_id,
                timestamp: now,
            });
        }

        match self.store.prune_keys(now).await {
            Ok(0) => {}
            Ok(pruned) => tracing::debug!(queue = %self.queue, pruned, "Pruned idempotency keys"),
            Err(e) => tracing::warn!("Failed to prune idempotency keys: {}", e),
        }

        reaped
    }

    /// Look up a live job, leased or not.
    pub fn find(&self, job_id: JobId) -> Option<Job> {
        self.in_flight.get(&job_id).cloned().or_else(|| {
            self.eligible
                .iter()
                .find(|entry| entry.0.id == job_id)
                .map(|entry| entry.0.clone())
        })
    }

    pub async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        self.store
            .dead_letters(Some(self.queue), limit)
            .await
            .map_err(store_error)
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> QueueSnapshot {
        let ready = self
            .eligible
            .iter()
            .filter(|entry| entry.0.not_before <= now)
            .count() as u64;
        let expired_leases = self
            .in_flight
            .values()
            .filter(|job| job.lease.as_ref().is_some_and(|lease| lease.is_expired(now)))
            .count() as u64;

        QueueSnapshot {
            queue: self.queue,
            ready,
            delayed: self.eligible.len() as u64 - ready,
            in_flight: self.in_flight.len() as u64,
            expired_leases,
            acked: self.counters.acked,
            retried: self.counters.retried,
            deferred: self.counters.deferred,
            reaped: self.counters.reaped,
            dead_letters: self.counters.dead_letters,
            taken_at: now,
        }
    }
}

/// Queue actor that manages a single queue.
pub struct QueueActor;

impl Actor for QueueActor {
    type Msg = QueueMessage;
    type State = QueueActorState;
    type Arguments = QueueActorState;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        mut args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting queue actor: {}", args.queue);
        args.recover()
            .await
            .map_err(|e| ActorProcessingErr::from(format!("Failed to recover queue {}: {}", args.queue, e)))?;
        Ok(args)
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let now = Utc::now();
        match message {
            QueueMessage::Enqueue { job, reply } => {
                let _ = reply.send(state.enqueue(*job, now).await);
            }

            QueueMessage::Dequeue {
                worker_id,
                lease_duration,
                reply,
            } => {
                let _ = reply.send(state.dequeue(&worker_id, lease_duration, now).await);
            }

            QueueMessage::Ack {
                job_id,
                worker_id,
                reply,
            } => {
                let _ = reply.send(state.ack(job_id, &worker_id, now).await);
            }

            QueueMessage::Retry {
                job_id,
                worker_id,
                delay,
                error,
                reply,
            } => {
                let _ = reply.send(state.retry(job_id, &worker_id, delay, error, now).await);
            }

            QueueMessage::Defer {
                job_id,
                worker_id,
                delay,
                reason,
                reply,
            } => {
                let _ = reply.send(state.defer(job_id, &worker_id, delay, reason, now).await);
            }

            QueueMessage::DeadLetter {
                job_id,
                worker_id,
                error,
                reply,
            } => {
                let _ = reply.send(state.dead_letter(job_id, &worker_id, error, now).await);
            }

            QueueMessage::ReapExpiredLeases { reply } => {
                let reaped = state.reap_expired(now).await;
                if let Some(reply) = reply {
                    let _ = reply.send(reaped);
                }
            }

            QueueMessage::GetJob { job_id, reply } => {
                let _ = reply.send(state.find(job_id));
            }

            QueueMessage::ListDeadLetters { limit, reply } => {
                let _ = reply.send(state.list_dead_letters(limit).await);
            }

            QueueMessage::GetSnapshot { reply } => {
                let _ = reply.send(state.snapshot(now));
            }
        }

        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        tracing::info!(
            queue = %state.queue,
            eligible = state.eligible.len(),
            in_flight = state.in_flight.len(),
            "Queue actor stopped"
        );
        Ok(())
    }
}
