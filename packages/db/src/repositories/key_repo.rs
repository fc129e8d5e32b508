//! Idempotency key reservations.

use chrono::{DateTime, Utc};
use dispatch_core::JobId;
use serde::{Deserialize, Serialize};

use super::job_repo::parse_job_id;
use crate::{Database, DbError};

/// Repository for producer deduplication keys.
pub struct IdempotencyKeyRepository;

#[derive(Debug, Serialize, Deserialize)]
struct KeyRecord {
    key: String,
    job_id: String,
    expires_at_ms: i64,
}

impl IdempotencyKeyRepository {
    /// Reserve `key` for `job_id` until `expires_at`.
    ///
    /// Returns the job already holding an unexpired reservation, if any; in
    /// that case nothing is written.
    pub async fn reserve(
        db: &Database,
        key: &str,
        job_id: JobId,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<JobId>, DbError> {
        let record_id = ("idempotency_key", key.to_string());

        let existing: Option<KeyRecord> = db.select(record_id.clone()).await?;
        if let Some(existing) = existing
            && existing.expires_at_ms > now.timestamp_millis()
        {
            return parse_job_id(&existing.job_id).map(Some);
        }

        let _: Option<KeyRecord> = db
            .upsert(record_id)
            .content(KeyRecord {
                key: key.to_string(),
                job_id: job_id.to_string(),
                expires_at_ms: expires_at.timestamp_millis(),
            })
            .await?;

        Ok(None)
    }

    /// Drop the reservation of `key` if `job_id` holds it.
    pub async fn release(db: &Database, key: &str, job_id: JobId) -> Result<(), DbError> {
        db.query("DELETE type::thing('idempotency_key', $key) WHERE job_id = $job_id")
            .bind(("key", key.to_string()))
            .bind(("job_id", job_id.to_string()))
            .await?
            .check()?;

        Ok(())
    }

    /// Drop reservations that expired at or before `now`.
    pub async fn prune(db: &Database, now: DateTime<Utc>) -> Result<u64, DbError> {
        let mut response = db
            .query("DELETE idempotency_key WHERE expires_at_ms <= $now RETURN BEFORE")
            .bind(("now", now.timestamp_millis()))
            .await?;

        let removed: Vec<KeyRecord> = response.take(0)?;

        Ok(removed.len() as u64)
    }
}
