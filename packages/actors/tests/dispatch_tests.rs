#![allow(clippy::disallowed_methods)]

mod common;

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use actors::{ClientRegistry, DispatchError, start};
use chrono::{TimeDelta, Utc};
use db::{JobStore, MemoryStore};
use dispatch_core::{
    BreakerConfig, Cadence, CircuitState, DeadLetterReason, Job, JobEvent, Lease, QueueError,
    QueueName, ScheduleConfig,
};
use serde_json::json;
use tokio::sync::broadcast;

use common::{ScriptedClient, Step, acked, eventually, fast_config};

fn drain(rx: &mut broadcast::Receiver<JobEvent>) -> Vec<JobEvent> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

#[tokio::test]
async fn test_retries_then_succeeds() -> Result<(), Box<dyn Error>> {
    let store = MemoryStore::new();
    let client = ScriptedClient::new(
        QueueName::Jira,
        vec![Step::Retryable("503"), Step::Retryable("502")],
        Step::Succeed,
    );
    let clients = ClientRegistry::new().with(client.clone());
    let (dispatch, _join) = start(fast_config(), clients, Arc::new(store.clone())).await?;
    let mut events = dispatch.subscribe();

    let job_id = dispatch
        .enqueue(QueueName::Jira, json!({"issue": "DEP-7", "version": "1.4.2"}), Some(3))
        .await?;
    assert!(acked(&dispatch, QueueName::Jira, 1).await, "job was never acked");

    assert_eq!(client.attempts_seen(), vec![0, 1, 2]);

    let delays: Vec<TimeDelta> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            JobEvent::JobRetryScheduled {
                job_id: id,
                not_before,
                timestamp,
                ..
            } if id == job_id => Some(not_before - timestamp),
            _ => None,
        })
        .collect();
    assert_eq!(delays, vec![TimeDelta::milliseconds(50), TimeDelta::milliseconds(100)]);

    let snapshot = dispatch.snapshot().await?;
    let jira = snapshot.queue(QueueName::Jira).unwrap();
    assert_eq!(jira.retried, 2);
    assert_eq!(jira.dead_letters, 0);
    assert_eq!(jira.depth(), 0);
    assert!(dispatch.get_job(job_id).await?.is_none());
    assert_eq!(store.job_count(), 0);

    dispatch.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_non_retryable_failure_dead_letters_immediately() -> Result<(), Box<dyn Error>> {
    let store = MemoryStore::new();
    let client = ScriptedClient::always(QueueName::Jira, Step::NonRetryable("400 unknown project"));
    let clients = ClientRegistry::new().with(client.clone());
    let (dispatch, _join) = start(fast_config(), clients, Arc::new(store)).await?;

    let job_id = dispatch
        .enqueue(QueueName::Jira, json!({"project": "NOPE"}), Some(1))
        .await?;

    let dead_lettered = eventually(Duration::from_secs(5), || async {
        dispatch
            .dead_letters(Some(QueueName::Jira), 10)
            .await
            .map(|dead| !dead.is_empty())
            .unwrap_or(false)
    })
    .await;
    assert!(dead_lettered);

    let dead = dispatch.dead_letters(None, 10).await?;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].job.id, job_id);
    assert_eq!(dead[0].reason, DeadLetterReason::NonRetryable);
    assert_eq!(dead[0].final_error, "400 unknown project");

    let snapshot = dispatch.snapshot().await?;
    assert_eq!(snapshot.queue(QueueName::Jira).unwrap().retried, 0);
    assert_eq!(snapshot.dead_letters(), 1);
    assert_eq!(client.calls(), 1);

    dispatch.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_exhausted_attempts_dead_letter_once() -> Result<(), Box<dyn Error>> {
    let store = MemoryStore::new();
    let client = ScriptedClient::always(QueueName::Slack, Step::Retryable("timeout"));
    let clients = ClientRegistry::new().with(client.clone());
    let (dispatch, _join) = start(fast_config(), clients, Arc::new(store)).await?;

    dispatch
        .enqueue(QueueName::Slack, json!({"channel": "#deploys"}), Some(2))
        .await?;

    let buried = eventually(Duration::from_secs(5), || async {
        dispatch
            .snapshot()
            .await
            .map(|snapshot| snapshot.dead_letters() == 1)
            .unwrap_or(false)
    })
    .await;
    assert!(buried);

    // Give any stray worker time to touch the job again.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(client.attempts_seen(), vec![0, 1]);
    let dead = dispatch.dead_letters(Some(QueueName::Slack), 10).await?;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].reason, DeadLetterReason::Exhausted);
    assert_eq!(dead[0].job.attempt, 2);

    dispatch.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_open_breaker_stops_calls() -> Result<(), Box<dyn Error>> {
    let store = MemoryStore::new();
    let mut config = fast_config();
    config.slack = config
        .slack
        .clone()
        .with_default_max_attempts(10)
        .with_cooldown(Duration::from_secs(3600))
        .with_circuit_breaker(Some(BreakerConfig::new(3, Duration::from_secs(3600))));
    let client = ScriptedClient::always(QueueName::Slack, Step::Retryable("500"));
    let clients = ClientRegistry::new().with(client.clone());
    let (dispatch, _join) = start(config, clients, Arc::new(store)).await?;

    for n in 0..3 {
        dispatch
            .enqueue(QueueName::Slack, json!({"text": format!("deploy {n}")}), None)
            .await?;
    }

    let opened = eventually(Duration::from_secs(5), || async {
        dispatch
            .snapshot()
            .await
            .ok()
            .and_then(|snapshot| snapshot.queue(QueueName::Slack).map(|q| q.deferred >= 1))
            .unwrap_or(false)
    })
    .await;
    assert!(opened, "no job was deferred by the open circuit");

    let breaker = dispatch.breaker(QueueName::Slack).unwrap();
    assert_eq!(breaker.state(), CircuitState::Open);
    assert_eq!(client.calls(), 3);

    // Everything left is parked behind the cooldown without reaching the client.
    let parked = eventually(Duration::from_secs(5), || async {
        dispatch
            .snapshot()
            .await
            .ok()
            .and_then(|snapshot| snapshot.queue(QueueName::Slack).map(|q| q.delayed == 3))
            .unwrap_or(false)
    })
    .await;
    assert!(parked);
    assert_eq!(client.calls(), 3);

    let snapshot = dispatch.snapshot().await?;
    assert_eq!(snapshot.breaker(QueueName::Slack).unwrap().state, CircuitState::Open);
    assert_eq!(snapshot.dead_letters(), 0);

    dispatch.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_enqueue_fails_when_store_is_down() -> Result<(), Box<dyn Error>> {
    let store = MemoryStore::new();
    let (dispatch, _join) = start(fast_config(), ClientRegistry::new(), Arc::new(store.clone())).await?;

    store.set_available(false);
    let result = dispatch.enqueue(QueueName::Metrics, json!({}), None).await;
    assert!(matches!(
        result,
        Err(DispatchError::Queue(QueueError::StoreUnavailable(_)))
    ));

    store.set_available(true);
    dispatch.enqueue(QueueName::Metrics, json!({}), None).await?;
    assert_eq!(store.job_count(), 1);

    dispatch.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_jobs_survive_restart() -> Result<(), Box<dyn Error>> {
    let store = MemoryStore::new();

    // A job leased by a worker of a previous run that never came back.
    let mut orphan = Job::new(QueueName::Metrics, json!({"report": "lead_time"}));
    orphan.attempt = 1;
    orphan.max_attempts = 3;
    orphan.lease = Some(Lease {
        worker_id: "metrics-worker-9".into(),
        expires_at: Utc::now() - TimeDelta::seconds(5),
    });
    store.insert_job(&orphan).await?;

    // First run has no clients, so jobs only accumulate.
    let (dispatch, _join) = start(fast_config(), ClientRegistry::new(), Arc::new(store.clone())).await?;
    dispatch
        .enqueue(QueueName::Metrics, json!({"report": "deploy_frequency"}), None)
        .await?;
    let snapshot = dispatch.snapshot().await?;
    let metrics = snapshot.queue(QueueName::Metrics).unwrap();
    assert_eq!(metrics.in_flight, 1);
    assert_eq!(metrics.expired_leases, 1);
    assert_eq!(metrics.ready, 1);
    dispatch.shutdown().await?;

    let client = ScriptedClient::always(QueueName::Metrics, Step::Succeed);
    let clients = ClientRegistry::new().with(client.clone());
    let (dispatch, _join) = start(fast_config(), clients, Arc::new(store.clone())).await?;
    assert_eq!(dispatch.reap_now().await?, 1);
    assert!(acked(&dispatch, QueueName::Metrics, 2).await);

    let mut seen = client.attempts_seen();
    seen.sort();
    assert_eq!(seen, vec![0, 1], "reaped job kept its attempt");
    assert_eq!(store.job_count(), 0);

    dispatch.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_crashed_worker_is_replaced() -> Result<(), Box<dyn Error>> {
    let store = MemoryStore::new();
    let mut config = fast_config().with_reap_interval(Duration::from_millis(100));
    config.jira = config
        .jira
        .clone()
        .with_lease_duration(Duration::from_millis(400))
        .with_call_timeout(Duration::from_millis(200));
    let client = ScriptedClient::new(QueueName::Jira, vec![Step::Panic], Step::Succeed);
    let clients = ClientRegistry::new().with(client.clone());
    let (dispatch, _join) = start(config, clients, Arc::new(store)).await?;
    let mut events = dispatch.subscribe();

    dispatch
        .enqueue(QueueName::Jira, json!({"issue": "DEP-9"}), Some(3))
        .await?;
    assert!(acked(&dispatch, QueueName::Jira, 1).await, "job was not recovered");

    // The crash spent no attempt; the reaper returned the job unchanged.
    assert_eq!(client.attempts_seen(), vec![0, 0]);
    let events = drain(&mut events);
    assert!(events.iter().any(|e| matches!(e, JobEvent::LeaseExpired { .. })));
    assert!(
        events
            .iter()
            .filter(|e| matches!(e, JobEvent::WorkerStarted { queue: QueueName::Jira, .. }))
            .count()
            >= 1
    );

    dispatch.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_scheduler_fires_once_per_slot() -> Result<(), Box<dyn Error>> {
    let store = MemoryStore::new();
    let schedule = ScheduleConfig::new(
        "deploy-sla",
        QueueName::Metrics,
        Cadence::every(Duration::from_secs(24 * 60 * 60)),
    )
    .with_payload(json!({"report": "sla"}));
    let config = fast_config().with_schedule(schedule);

    let (dispatch, _join) = start(config.clone(), ClientRegistry::new(), Arc::new(store.clone())).await?;
    let fired = eventually(Duration::from_secs(5), || async { store.job_count() == 1 }).await;
    assert!(fired);
    // Several more ticks in the same slot.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.job_count(), 1);
    dispatch.shutdown().await?;

    // A restart inside the same slot fires again, but the key absorbs it.
    let (dispatch, _join) = start(config, ClientRegistry::new(), Arc::new(store.clone())).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(store.job_count(), 1);
    assert_eq!(dispatch.snapshot().await?.queue(QueueName::Metrics).unwrap().ready, 1);

    dispatch.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let mut config = fast_config();
    config.jira = config.jira.clone().with_call_timeout(Duration::from_secs(10));
    let result = start(config, ClientRegistry::new(), Arc::new(MemoryStore::new())).await;
    assert!(matches!(result, Err(DispatchError::Config(_))));
}
