//! Job repository for CRUD operations.

use chrono::{DateTime, SecondsFormat, Utc};
use dispatch_core::{Job, JobId, Lease, QueueName};
use serde::{Deserialize, Serialize};

use crate::{Database, DbError};

/// Repository for live job records.
pub struct JobRepository;

/// Timestamps are stored as RFC 3339 text at full precision.
pub(crate) fn timestamp_text(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

pub(crate) fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(text)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| DbError::Serialization(format!("bad timestamp {}: {}", text, e)))
}

pub(crate) fn parse_job_id(text: &str) -> Result<JobId, DbError> {
    JobId::parse(text).map_err(|e| DbError::Serialization(format!("bad job id {}: {}", text, e)))
}

/// Stored shape of a job. The SurrealDB record id is the job id, so the job's
/// own id is kept under `job_id`. The lease is flattened into two optional
/// fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct JobRecord {
    job_id: String,
    queue: QueueName,
    payload: String,
    attempt: u32,
    max_attempts: u32,
    not_before: String,
    created_at: String,
    updated_at: String,
    last_error: Option<String>,
    idempotency_key: Option<String>,
    lease_worker_id: Option<String>,
    lease_expires_at: Option<String>,
}

impl JobRecord {
    fn from_job(job: &Job) -> Result<Self, DbError> {
        Ok(Self {
            job_id: job.id.to_string(),
            queue: job.queue,
            payload: serde_json::to_string(&job.payload)?,
            attempt: job.attempt,
            max_attempts: job.max_attempts,
            not_before: timestamp_text(job.not_before),
            created_at: timestamp_text(job.created_at),
            updated_at: timestamp_text(job.updated_at),
            last_error: job.last_error.clone(),
            idempotency_key: job.idempotency_key.clone(),
            lease_worker_id: job.lease.as_ref().map(|lease| lease.worker_id.clone()),
            lease_expires_at: job.lease.as_ref().map(|lease| timestamp_text(lease.expires_at)),
        })
    }

    fn into_job(self) -> Result<Job, DbError> {
        let lease = match (self.lease_worker_id, self.lease_expires_at) {
            (Some(worker_id), Some(expires_at)) => Some(Lease {
                worker_id,
                expires_at: parse_timestamp(&expires_at)?,
            }),
            _ => None,
        };
        Ok(Job {
            id: parse_job_id(&self.job_id)?,
            queue: self.queue,
            payload: serde_json::from_str(&self.payload)?,
            attempt: self.attempt,
            max_attempts: self.max_attempts,
            not_before: parse_timestamp(&self.not_before)?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            last_error: self.last_error,
            idempotency_key: self.idempotency_key,
            lease,
        })
    }
}

impl JobRepository {
    /// Create a new job in the database.
    pub async fn create(db: &Database, job: &Job) -> Result<Job, DbError> {
        let record: Option<JobRecord> = db
            .create(("job", job.id.to_string()))
            .content(JobRecord::from_job(job)?)
            .await?;

        record
            .ok_or_else(|| DbError::Query("Failed to create job".into()))?
            .into_job()
    }

    /// Write the job's current state, creating the record if needed.
    pub async fn save(db: &Database, job: &Job) -> Result<Job, DbError> {
        let record: Option<JobRecord> = db
            .upsert(("job", job.id.to_string()))
            .content(JobRecord::from_job(job)?)
            .await?;

        record
            .ok_or_else(|| DbError::Query(format!("Failed to save job {}", job.id)))?
            .into_job()
    }

    /// Get a job by ID.
    pub async fn get(db: &Database, id: JobId) -> Result<Job, DbError> {
        let record: Option<JobRecord> = db.select(("job", id.to_string())).await?;

        record
            .ok_or_else(|| DbError::NotFound(format!("Job not found: {}", id)))?
            .into_job()
    }

    /// All jobs owned by a queue, eligible or leased.
    pub async fn list_for_queue(db: &Database, queue: QueueName) -> Result<Vec<Job>, DbError> {
        let mut result = db
            .query("SELECT * FROM job WHERE queue = $queue")
            .bind(("queue", queue.as_str().to_string()))
            .await?;

        let records: Vec<JobRecord> = result.take(0)?;

        records.into_iter().map(JobRecord::into_job).collect()
    }

    /// Delete a job.
    pub async fn delete(db: &Database, id: JobId) -> Result<(), DbError> {
        let _: Option<JobRecord> = db.delete(("job", id.to_string())).await?;

        Ok(())
    }
}
