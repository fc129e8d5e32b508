//! In-process [`JobStore`] for tests and local development.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use dispatch_core::{DeadLetter, Job, JobId, QueueName};

use crate::DbError;
use crate::store::{JobStore, StoreFuture};

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<JobId, Job>,
    dead_letters: HashMap<JobId, DeadLetter>,
    keys: HashMap<String, (JobId, DateTime<Utc>)>,
}

struct Inner {
    state: Mutex<MemoryState>,
    available: AtomicBool,
}

/// Store that keeps everything in memory.
///
/// Clones share the same data, so a test can drop a running system and start
/// a new one over the same store to simulate a restart. Availability can be
/// switched off to exercise `StoreUnavailable` paths.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(MemoryState::default()),
                available: AtomicBool::new(true),
            }),
        }
    }

    /// Make every subsequent operation fail (or succeed again).
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Stored copy of a job, if it is still live.
    pub fn job(&self, id: JobId) -> Option<Job> {
        self.lock().jobs.get(&id).cloned()
    }

    /// Number of live jobs across all queues.
    pub fn job_count(&self) -> usize {
        self.lock().jobs.len()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> Result<T, DbError>) -> Result<T, DbError> {
        if !self.inner.available.load(Ordering::SeqCst) {
            return Err(DbError::Unavailable("memory store switched off".into()));
        }
        f(&mut self.lock())
    }
}

impl JobStore for MemoryStore {
    fn insert_job<'a>(&'a self, job: &'a Job) -> StoreFuture<'a, ()> {
        let result = self.with_state(|state| {
            if state.jobs.contains_key(&job.id) {
                return Err(DbError::Query(format!("Job already exists: {}", job.id)));
            }
            state.jobs.insert(job.id, job.clone());
            Ok(())
        });
        Box::pin(async move { result })
    }

    fn save_job<'a>(&'a self, job: &'a Job) -> StoreFuture<'a, ()> {
        let result = self.with_state(|state| {
            state.jobs.insert(job.id, job.clone());
            Ok(())
        });
        Box::pin(async move { result })
    }

    fn delete_job(&self, id: JobId) -> StoreFuture<'_, ()> {
        let result = self.with_state(|state| {
            state.jobs.remove(&id);
            Ok(())
        });
        Box::pin(async move { result })
    }

    fn load_jobs(&self, queue: QueueName) -> StoreFuture<'_, Vec<Job>> {
        let result = self.with_state(|state| {
            Ok(state
                .jobs
                .values()
                .filter(|job| job.queue == queue)
                .cloned()
                .collect())
        });
        Box::pin(async move { result })
    }

    fn bury<'a>(&'a self, dead: &'a DeadLetter) -> StoreFuture<'a, bool> {
        let result = self.with_state(|state| {
            state.jobs.remove(&dead.job.id);
            if state.dead_letters.contains_key(&dead.job.id) {
                return Ok(false);
            }
            state.dead_letters.insert(dead.job.id, dead.clone());
            Ok(true)
        });
        Box::pin(async move { result })
    }

    fn dead_letters(
        &self,
        queue: Option<QueueName>,
        limit: usize,
    ) -> StoreFuture<'_, Vec<DeadLetter>> {
        let result = self.with_state(|state| {
            let mut dead: Vec<DeadLetter> = state
                .dead_letters
                .values()
                .filter(|d| queue.is_none_or(|q| d.job.queue == q))
                .cloned()
                .collect();
            dead.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));
            dead.truncate(limit);
            Ok(dead)
        });
        Box::pin(async move { result })
    }

    fn count_dead_letters(&self, queue: QueueName) -> StoreFuture<'_, u64> {
        let result = self.with_state(|state| {
            Ok(state
                .dead_letters
                .values()
                .filter(|d| d.job.queue == queue)
                .count() as u64)
        });
        Box::pin(async move { result })
    }

    fn reserve_key<'a>(
        &'a self,
        key: &'a str,
        job_id: JobId,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, Option<JobId>> {
        let result = self.with_state(|state| {
            if let Some((holder, expiry)) = state.keys.get(key)
                && *expiry > now
            {
                return Ok(Some(*holder));
            }
            state.keys.insert(key.to_string(), (job_id, expires_at));
            Ok(None)
        });
        Box::pin(async move { result })
    }

    fn release_key<'a>(&'a self, key: &'a str, job_id: JobId) -> StoreFuture<'a, ()> {
        let result = self.with_state(|state| {
            if state.keys.get(key).is_some_and(|(holder, _)| *holder == job_id) {
                state.keys.remove(key);
            }
            Ok(())
        });
        Box::pin(async move { result })
    }

    fn prune_keys(&self, now: DateTime<Utc>) -> StoreFuture<'_, u64> {
        let result = self.with_state(|state| {
            let before = state.keys.len();
            state.keys.retain(|_, (_, expiry)| *expiry > now);
            Ok((before - state.keys.len()) as u64)
        });
        Box::pin(async move { result })
    }
}
