#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use actors::{CallFuture, Client, ClientError, DispatchHandle};
use dispatch_core::{BackoffPolicy, CallResponse, DispatchConfig, Job, QueueConfig, QueueName};

/// What a scripted call does.
#[derive(Debug, Clone)]
pub enum Step {
    Succeed,
    Retryable(&'static str),
    NonRetryable(&'static str),
    Panic,
    Hang,
}

#[derive(Default)]
struct Script {
    steps: VecDeque<Step>,
    /// Attempt number of every job the client was called with.
    attempts_seen: Vec<u32>,
}

/// Client replaying a fixed script, then `fallback` forever.
#[derive(Clone)]
pub struct ScriptedClient {
    destination: QueueName,
    fallback: Step,
    script: Arc<Mutex<Script>>,
}

impl ScriptedClient {
    pub fn new(destination: QueueName, steps: Vec<Step>, fallback: Step) -> Self {
        Self {
            destination,
            fallback,
            script: Arc::new(Mutex::new(Script {
                steps: steps.into(),
                attempts_seen: Vec::new(),
            })),
        }
    }

    pub fn always(destination: QueueName, step: Step) -> Self {
        Self::new(destination, Vec::new(), step)
    }

    pub fn calls(&self) -> usize {
        self.script.lock().unwrap().attempts_seen.len()
    }

    pub fn attempts_seen(&self) -> Vec<u32> {
        self.script.lock().unwrap().attempts_seen.clone()
    }
}

impl Client for ScriptedClient {
    fn destination(&self) -> QueueName {
        self.destination
    }

    fn call<'a>(&'a self, job: &'a Job) -> CallFuture<'a> {
        let step = {
            let mut script = self.script.lock().unwrap();
            script.attempts_seen.push(job.attempt);
            script.steps.pop_front().unwrap_or_else(|| self.fallback.clone())
        };
        Box::pin(async move {
            match step {
                Step::Succeed => Ok(CallResponse::new(format!("delivered {}", job.id))),
                Step::Retryable(msg) => Err(ClientError::retryable(msg)),
                Step::NonRetryable(msg) => Err(ClientError::non_retryable(msg)),
                Step::Panic => panic!("client crashed"),
                Step::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(CallResponse::new("too late"))
                }
            }
        })
    }
}

/// A queue configuration with millisecond timings and no gates.
pub fn fast_queue() -> QueueConfig {
    QueueConfig::default()
        .with_workers(1)
        .with_lease_duration(Duration::from_millis(800))
        .with_call_timeout(Duration::from_millis(300))
        .with_poll_interval(Duration::from_millis(10), Duration::from_millis(50))
        .with_cooldown(Duration::from_millis(100))
        .with_backoff(
            BackoffPolicy::new(Duration::from_millis(50), Duration::from_secs(1)).with_jitter(0.0),
        )
        .with_rate_limit(None)
        .with_circuit_breaker(None)
}

/// Every queue on [`fast_queue`], the reaper effectively off.
pub fn fast_config() -> DispatchConfig {
    let mut config = DispatchConfig::default()
        .with_queue(QueueName::Jira, fast_queue())
        .with_queue(QueueName::Slack, fast_queue())
        .with_queue(QueueName::Metrics, fast_queue())
        .with_reap_interval(Duration::from_secs(3600));
    config.scheduler_tick = Duration::from_millis(20);
    config.rpc_timeout = Duration::from_secs(2);
    config
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until `queue` has acked `count` jobs.
pub async fn acked(dispatch: &DispatchHandle, queue: QueueName, count: u64) -> bool {
    eventually(Duration::from_secs(5), || async {
        dispatch
            .snapshot()
            .await
            .ok()
            .and_then(|snapshot| snapshot.queue(queue).map(|q| q.acked >= count))
            .unwrap_or(false)
    })
    .await
}
