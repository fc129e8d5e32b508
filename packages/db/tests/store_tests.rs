#![allow(clippy::disallowed_methods)]

mod common;

use chrono::{Duration, Utc};
use dispatch_core::{DeadLetter, DeadLetterReason, Job, Lease, QueueName};
use serde_json::json;
use std::error::Error;

use db::repositories::{DeadLetterRepository, JobRepository};
use db::{DbError, JobStore};

#[tokio::test]
async fn test_job_lifecycle() -> Result<(), Box<dyn Error>> {
    let store = common::store().await?;

    let job = Job::new(QueueName::Jira, json!({"project": "OPS", "summary": "Deploy api 1.4.2"}))
        .with_max_attempts(4)
        .with_idempotency_key("release:1.4.2");
    store.insert_job(&job).await?;

    let loaded = JobRepository::get(store.database(), job.id).await?;
    assert_eq!(loaded, job);
    assert_eq!(loaded.payload["project"], "OPS");

    // Lease survives a reload
    let mut leased = loaded.clone();
    leased.lease = Some(Lease {
        worker_id: "jira-worker-1".to_string(),
        expires_at: Utc::now() + Duration::seconds(60),
    });
    leased.last_error = Some("503".to_string());
    store.save_job(&leased).await?;

    let jobs = store.load_jobs(QueueName::Jira).await?;
    assert_eq!(jobs, vec![leased]);
    assert!(store.load_jobs(QueueName::Slack).await?.is_empty());

    store.delete_job(job.id).await?;
    let missing = JobRepository::get(store.database(), job.id).await;
    assert!(matches!(missing, Err(DbError::NotFound(_))));

    Ok(())
}

#[tokio::test]
async fn test_any_json_payload_round_trips() -> Result<(), Box<dyn Error>> {
    let store = common::store().await?;

    let job = Job::new(QueueName::Metrics, json!(["deploy", 3, null, {"nested": true}]));
    store.insert_job(&job).await?;

    let loaded = JobRepository::get(store.database(), job.id).await?;
    assert_eq!(loaded.payload, job.payload);

    Ok(())
}

#[tokio::test]
async fn test_schema_rejects_untyped_records() -> Result<(), Box<dyn Error>> {
    let store = common::store().await?;

    let result = store
        .database()
        .query("CREATE job:bad CONTENT { job_id: 'bad', queue: 'jira', attempt: 'many' }")
        .await?
        .check();
    assert!(result.is_err());
    assert!(store.load_jobs(QueueName::Jira).await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_stores_do_not_share_data() -> Result<(), Box<dyn Error>> {
    let first = common::store().await?;
    let second = common::store().await?;

    let job = Job::new(QueueName::Slack, json!({"channel": "#deploys"}));
    first.insert_job(&job).await?;

    assert_eq!(first.load_jobs(QueueName::Slack).await?.len(), 1);
    assert!(second.load_jobs(QueueName::Slack).await?.is_empty());

    // Clones share the connection.
    assert_eq!(first.clone().load_jobs(QueueName::Slack).await?.len(), 1);

    Ok(())
}

#[tokio::test]
async fn test_dead_letters_are_written_once() -> Result<(), Box<dyn Error>> {
    let store = common::store().await?;

    let job = Job::new(QueueName::Slack, json!({"channel": "#deploys"}));
    store.insert_job(&job).await?;

    let now = Utc::now();
    let first = DeadLetter::new(job.clone(), "channel_not_found", DeadLetterReason::NonRetryable, now);
    let second = DeadLetter::new(job.clone(), "again", DeadLetterReason::Exhausted, now);

    assert!(store.bury(&first).await?);
    assert!(!store.bury(&second).await?);

    let stored = DeadLetterRepository::get(store.database(), job.id).await?;
    assert_eq!(stored, first);

    assert_eq!(store.count_dead_letters(QueueName::Slack).await?, 1);
    assert_eq!(store.count_dead_letters(QueueName::Jira).await?, 0);
    assert_eq!(store.dead_letters(None, 10).await?.len(), 1);
    assert!(store.load_jobs(QueueName::Slack).await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_idempotency_keys() -> Result<(), Box<dyn Error>> {
    let store = common::store().await?;

    let now = Utc::now();
    let first = Job::new(QueueName::Metrics, json!({}));
    let second = Job::new(QueueName::Metrics, json!({}));
    let expiry = now + Duration::minutes(10);

    assert_eq!(store.reserve_key("sla-metrics:1700000000", first.id, expiry, now).await?, None);
    assert_eq!(
        store.reserve_key("sla-metrics:1700000000", second.id, expiry, now).await?,
        Some(first.id)
    );

    let later = now + Duration::minutes(11);
    assert_eq!(store.prune_keys(later).await?, 1);
    assert_eq!(
        store.reserve_key("sla-metrics:1700000000", second.id, later + Duration::minutes(10), later).await?,
        None
    );

    Ok(())
}

#[tokio::test]
async fn test_key_release_is_holder_only() -> Result<(), Box<dyn Error>> {
    let store = common::store().await?;

    let now = Utc::now();
    let holder = Job::new(QueueName::Jira, json!({}));
    let other = Job::new(QueueName::Jira, json!({}));
    let expiry = now + Duration::minutes(10);
    store.reserve_key("release:2.0.0", holder.id, expiry, now).await?;

    store.release_key("release:2.0.0", other.id).await?;
    assert_eq!(
        store.reserve_key("release:2.0.0", other.id, expiry, now).await?,
        Some(holder.id)
    );

    store.release_key("release:2.0.0", holder.id).await?;
    assert_eq!(store.reserve_key("release:2.0.0", other.id, expiry, now).await?, None);

    Ok(())
}
