//! Dead-letter repository.

use dispatch_core::{DeadLetter, DeadLetterReason, Job, JobId, QueueName};
use serde::{Deserialize, Serialize};

use super::job_repo::{parse_timestamp, timestamp_text};
use crate::{Database, DbError};

/// Repository for terminal job records.
pub struct DeadLetterRepository;

#[derive(Debug, Serialize, Deserialize)]
struct DeadLetterRecord {
    job_id: String,
    queue: QueueName,
    /// JSON snapshot of the job as it failed.
    job: String,
    final_error: String,
    reason: DeadLetterReason,
    failed_at: String,
    failed_at_ms: i64,
}

impl DeadLetterRecord {
    fn from_dead_letter(dead: &DeadLetter) -> Result<Self, DbError> {
        Ok(Self {
            job_id: dead.job.id.to_string(),
            queue: dead.job.queue,
            job: serde_json::to_string(&dead.job)?,
            final_error: dead.final_error.clone(),
            reason: dead.reason,
            failed_at: timestamp_text(dead.failed_at),
            failed_at_ms: dead.failed_at.timestamp_millis(),
        })
    }

    fn into_dead_letter(self) -> Result<DeadLetter, DbError> {
        let job: Job = serde_json::from_str(&self.job)?;
        Ok(DeadLetter {
            job,
            final_error: self.final_error,
            reason: self.reason,
            failed_at: parse_timestamp(&self.failed_at)?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct CountRow {
    count: i64,
}

impl DeadLetterRepository {
    /// Insert the dead letter unless one exists for the job already.
    ///
    /// Returns `true` when this call created the record.
    pub async fn insert_if_absent(db: &Database, dead: &DeadLetter) -> Result<bool, DbError> {
        let key = ("dead_letter", dead.job.id.to_string());

        let existing: Option<DeadLetterRecord> = db.select(key.clone()).await?;
        if existing.is_some() {
            return Ok(false);
        }

        let created: Option<DeadLetterRecord> = db
            .create(key)
            .content(DeadLetterRecord::from_dead_letter(dead)?)
            .await?;

        Ok(created.is_some())
    }

    /// Get the dead letter for a job.
    pub async fn get(db: &Database, id: JobId) -> Result<DeadLetter, DbError> {
        let record: Option<DeadLetterRecord> = db.select(("dead_letter", id.to_string())).await?;

        record
            .ok_or_else(|| DbError::NotFound(format!("Dead letter not found: {}", id)))?
            .into_dead_letter()
    }

    /// Most recent dead letters first.
    pub async fn list(
        db: &Database,
        queue: Option<QueueName>,
        limit: usize,
    ) -> Result<Vec<DeadLetter>, DbError> {
        let where_clause = if queue.is_some() {
            "WHERE queue = $queue"
        } else {
            ""
        };
        let query = format!(
            "SELECT * FROM dead_letter {} ORDER BY failed_at_ms DESC LIMIT $limit",
            where_clause
        );

        let mut request = db.query(query).bind(("limit", limit as i64));
        if let Some(queue) = queue {
            request = request.bind(("queue", queue.as_str().to_string()));
        }

        let mut response = request.await?;
        let records: Vec<DeadLetterRecord> = response.take(0)?;

        records
            .into_iter()
            .map(DeadLetterRecord::into_dead_letter)
            .collect()
    }

    /// Count dead letters for a queue.
    pub async fn count(db: &Database, queue: QueueName) -> Result<u64, DbError> {
        let mut response = db
            .query("SELECT count() AS count FROM dead_letter WHERE queue = $queue GROUP ALL")
            .bind(("queue", queue.as_str().to_string()))
            .await?;

        let rows: Vec<CountRow> = response.take(0)?;

        Ok(rows.first().map_or(0, |row| row.count.max(0) as u64))
    }
}
