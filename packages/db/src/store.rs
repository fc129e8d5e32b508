//! The persistence seam used by queue actors.

use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use dispatch_core::{DeadLetter, Job, JobId, QueueName};

use crate::repositories::{DeadLetterRepository, IdempotencyKeyRepository, JobRepository};
use crate::{Database, DbConfig, DbError};

/// Future type returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, DbError>> + Send + 'a>>;

/// Durable storage for jobs, dead letters and idempotency keys.
///
/// Every state change a queue makes is written here before it takes effect in
/// memory, so a restarted queue can rebuild itself with [`load_jobs`], leases
/// included.
///
/// [`load_jobs`]: JobStore::load_jobs
pub trait JobStore: Send + Sync + 'static {
    /// Persist a newly enqueued job.
    fn insert_job<'a>(&'a self, job: &'a Job) -> StoreFuture<'a, ()>;

    /// Overwrite a job's state (lease, attempt, `not_before`).
    fn save_job<'a>(&'a self, job: &'a Job) -> StoreFuture<'a, ()>;

    /// Remove an acknowledged job.
    fn delete_job(&self, id: JobId) -> StoreFuture<'_, ()>;

    /// Every live job of a queue.
    fn load_jobs(&self, queue: QueueName) -> StoreFuture<'_, Vec<Job>>;

    /// Record a dead letter and remove its live job.
    ///
    /// Idempotent per job id: returns `false` when a dead letter already
    /// existed, in which case the stored one is kept.
    fn bury<'a>(&'a self, dead: &'a DeadLetter) -> StoreFuture<'a, bool>;

    /// Most recent dead letters first.
    fn dead_letters(&self, queue: Option<QueueName>, limit: usize)
    -> StoreFuture<'_, Vec<DeadLetter>>;

    /// Number of dead letters recorded for a queue.
    fn count_dead_letters(&self, queue: QueueName) -> StoreFuture<'_, u64>;

    /// Reserve an idempotency key; returns the current holder if the key is
    /// still reserved.
    fn reserve_key<'a>(
        &'a self,
        key: &'a str,
        job_id: JobId,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, Option<JobId>>;

    /// Drop the reservation of `key` if `job_id` still holds it. Used to undo
    /// a reservation whose job could not be stored.
    fn release_key<'a>(&'a self, key: &'a str, job_id: JobId) -> StoreFuture<'a, ()>;

    /// Drop expired key reservations, returning how many were removed.
    fn prune_keys(&self, now: DateTime<Utc>) -> StoreFuture<'_, u64>;
}

/// [`JobStore`] backed by a SurrealDB connection it owns.
///
/// Clones share the connection.
#[derive(Clone)]
pub struct SurrealStore {
    db: Database,
}

impl SurrealStore {
    /// Connect and create the schema.
    pub async fn connect(config: DbConfig) -> Result<Self, DbError> {
        let db = crate::connection::connect(&config).await?;
        crate::init_schema(&db).await?;
        Ok(Self { db })
    }

    /// The underlying connection.
    pub fn database(&self) -> &Database {
        &self.db
    }
}

impl JobStore for SurrealStore {
    fn insert_job<'a>(&'a self, job: &'a Job) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            JobRepository::create(&self.db, job).await?;
            Ok(())
        })
    }

    fn save_job<'a>(&'a self, job: &'a Job) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            JobRepository::save(&self.db, job).await?;
            Ok(())
        })
    }

    fn delete_job(&self, id: JobId) -> StoreFuture<'_, ()> {
        Box::pin(JobRepository::delete(&self.db, id))
    }

    fn load_jobs(&self, queue: QueueName) -> StoreFuture<'_, Vec<Job>> {
        Box::pin(JobRepository::list_for_queue(&self.db, queue))
    }

    fn bury<'a>(&'a self, dead: &'a DeadLetter) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let created = DeadLetterRepository::insert_if_absent(&self.db, dead).await?;
            JobRepository::delete(&self.db, dead.job.id).await?;
            Ok(created)
        })
    }

    fn dead_letters(
        &self,
        queue: Option<QueueName>,
        limit: usize,
    ) -> StoreFuture<'_, Vec<DeadLetter>> {
        Box::pin(DeadLetterRepository::list(&self.db, queue, limit))
    }

    fn count_dead_letters(&self, queue: QueueName) -> StoreFuture<'_, u64> {
        Box::pin(DeadLetterRepository::count(&self.db, queue))
    }

    fn reserve_key<'a>(
        &'a self,
        key: &'a str,
        job_id: JobId,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, Option<JobId>> {
        Box::pin(IdempotencyKeyRepository::reserve(&self.db, key, job_id, expires_at, now))
    }

    fn release_key<'a>(&'a self, key: &'a str, job_id: JobId) -> StoreFuture<'a, ()> {
        Box::pin(IdempotencyKeyRepository::release(&self.db, key, job_id))
    }

    fn prune_keys(&self, now: DateTime<Utc>) -> StoreFuture<'_, u64> {
        Box::pin(IdempotencyKeyRepository::prune(&self.db, now))
    }
}
