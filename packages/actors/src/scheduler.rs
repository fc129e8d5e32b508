//! Scheduler actor enqueuing periodic jobs.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dispatch_core::{Job, JobEvent, QueueName, ScheduleConfig};
use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::messages::{DispatchError, QueueMessage, SchedulerMessage, ask};

struct ScheduleEntry {
    config: ScheduleConfig,
    next_fire: Option<DateTime<Utc>>,
}

/// Scheduler actor arguments.
pub struct SchedulerArgs {
    pub schedules: Vec<ScheduleConfig>,
    pub queues: HashMap<QueueName, ActorRef<QueueMessage>>,
    pub tick: Duration,
    pub rpc_timeout: Duration,
    pub cancel: CancellationToken,
    pub event_tx: Option<broadcast::Sender<JobEvent>>,
}

/// State for the scheduler actor.
pub struct SchedulerState {
    entries: Vec<ScheduleEntry>,
    queues: HashMap<QueueName, ActorRef<QueueMessage>>,
    rpc_timeout: Duration,
    event_tx: Option<broadcast::Sender<JobEvent>>,
}

impl SchedulerState {
    pub fn new(
        schedules: Vec<ScheduleConfig>,
        queues: HashMap<QueueName, ActorRef<QueueMessage>>,
        rpc_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        let entries = schedules
            .into_iter()
            .map(|config| {
                let next_fire = config.cadence.first_fire(now);
                tracing::info!(
                    schedule = %config.name,
                    queue = %config.queue,
                    cadence = %config.cadence.description(),
                    next_fire = ?next_fire,
                    "Registered schedule"
                );
                ScheduleEntry { config, next_fire }
            })
            .collect();
        Self {
            entries,
            queues,
            rpc_timeout,
            event_tx: None,
        }
    }

    /// Set the event broadcaster.
    pub fn with_event_tx(mut self, tx: broadcast::Sender<JobEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Next firing time of a schedule, by name.
    pub fn next_fire(&self, name: &str) -> Option<DateTime<Utc>> {
        self.entries
            .iter()
            .find(|entry| entry.config.name == name)
            .and_then(|entry| entry.next_fire)
    }

    /// Enqueue every due schedule. A failed enqueue keeps its firing time so
    /// the next tick tries again. Returns how many schedules fired.
    pub async fn fire_due(&mut self, now: DateTime<Utc>) -> usize {
        let mut fired = 0;
        for index in 0..self.entries.len() {
            let Some(due) = self.entries[index].next_fire else {
                continue;
            };
            if due > now {
                continue;
            }

            let config = self.entries[index].config.clone();
            match self.fire(&config, due, now).await {
                Ok(()) => {
                    fired += 1;
                    self.entries[index].next_fire = config.cadence.next_after(now);
                }
                Err(e) => {
                    tracing::warn!(schedule = %config.name, "Firing failed, retrying next tick: {}", e);
                }
            }
        }
        fired
    }

    async fn fire(
        &self,
        config: &ScheduleConfig,
        due: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), DispatchError> {
        let queue_ref = self
            .queues
            .get(&config.queue)
            .ok_or(dispatch_core::QueueError::QueueNotFound(config.queue))?;
        let slot = config.cadence.slot_for(due, now).unwrap_or(due);
        let key = config.idempotency_key(slot);

        let job = Job::new(config.queue, config.payload.clone())
            .with_max_attempts(config.max_attempts)
            .with_idempotency_key(key.clone());
        let created = job.id;

        let job_id = ask(
            queue_ref,
            |reply| QueueMessage::Enqueue {
                job: Box::new(job),
                reply,
            },
            self.rpc_timeout,
        )
        .await??;

        if job_id == created {
            tracing::info!(schedule = %config.name, %job_id, key = %key, "Schedule fired");
        } else {
            tracing::debug!(schedule = %config.name, %job_id, key = %key, "Slot already enqueued");
        }

        if let Some(ref tx) = self.event_tx {
            let _ = tx.send(JobEvent::ScheduleFired {
                name: config.name.clone(),
                queue: config.queue,
                job_id,
                idempotency_key: key,
                timestamp: now,
            });
        }
        Ok(())
    }
}

/// Scheduler actor driven by a fixed tick.
pub struct SchedulerActor;

impl Actor for SchedulerActor {
    type Msg = SchedulerMessage;
    type State = SchedulerState;
    type Arguments = SchedulerArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting scheduler with {} schedules", args.schedules.len());

        let mut state = SchedulerState::new(args.schedules, args.queues, args.rpc_timeout, Utc::now());
        if let Some(tx) = args.event_tx {
            state = state.with_event_tx(tx);
        }

        // Start periodic tick
        let cancel = args.cancel;
        let tick = args.tick;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if myself.send_message(SchedulerMessage::Tick).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(state)
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SchedulerMessage::Tick => {
                state.fire_due(Utc::now()).await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue_actor::{QueueActor, QueueActorState};
    use chrono::TimeDelta;
    use db::MemoryStore;
    use dispatch_core::Cadence;
    use serde_json::json;
    use std::sync::Arc;

    async fn metrics_queue(store: &MemoryStore) -> ActorRef<QueueMessage> {
        let state = QueueActorState::new(QueueName::Metrics, Arc::new(store.clone()));
        let (actor, _handle) = Actor::spawn(None, QueueActor, state).await.unwrap();
        actor
    }

    fn sla_schedule() -> ScheduleConfig {
        ScheduleConfig::new(
            "sla-metrics",
            QueueName::Metrics,
            Cadence::every(Duration::from_secs(300)),
        )
        .with_payload(json!({"report": "deploy_sla"}))
    }

    #[tokio::test]
    async fn duplicate_firing_in_one_slot_enqueues_once() {
        let store = MemoryStore::new();
        let queue = metrics_queue(&store).await;
        let queues = HashMap::from([(QueueName::Metrics, queue.clone())]);
        let now = Utc::now();

        let mut first = SchedulerState::new(vec![sla_schedule()], queues.clone(), Duration::from_secs(5), now);
        assert_eq!(first.fire_due(now).await, 1);

        // A restarted scheduler fires the same slot again.
        let mut restarted = SchedulerState::new(vec![sla_schedule()], queues, Duration::from_secs(5), now);
        assert_eq!(restarted.fire_due(now).await, 1);

        assert_eq!(store.job_count(), 1);
        queue.stop(None);
    }

    #[tokio::test]
    async fn next_fire_moves_to_the_next_slot() {
        let store = MemoryStore::new();
        let queue = metrics_queue(&store).await;
        let queues = HashMap::from([(QueueName::Metrics, queue.clone())]);
        let now = DateTime::from_timestamp(1_700_000_250, 0).unwrap();

        let mut scheduler = SchedulerState::new(vec![sla_schedule()], queues, Duration::from_secs(5), now);
        assert_eq!(
            scheduler.next_fire("sla-metrics"),
            DateTime::from_timestamp(1_700_000_100, 0)
        );
        assert_eq!(scheduler.fire_due(now).await, 1);
        assert_eq!(
            scheduler.next_fire("sla-metrics"),
            DateTime::from_timestamp(1_700_000_400, 0)
        );
        assert_eq!(scheduler.fire_due(now + TimeDelta::seconds(10)).await, 0);
        queue.stop(None);
    }

    #[tokio::test]
    async fn failed_firing_retries_on_the_next_tick() {
        let store = MemoryStore::new();
        let queue = metrics_queue(&store).await;
        let queues = HashMap::from([(QueueName::Metrics, queue.clone())]);
        let now = Utc::now();

        let mut scheduler = SchedulerState::new(vec![sla_schedule()], queues, Duration::from_secs(5), now);
        let due = scheduler.next_fire("sla-metrics");

        store.set_available(false);
        assert_eq!(scheduler.fire_due(now).await, 0);
        assert_eq!(scheduler.next_fire("sla-metrics"), due);

        store.set_available(true);
        assert_eq!(scheduler.fire_due(now + TimeDelta::seconds(1)).await, 1);
        assert_eq!(store.job_count(), 1);
        queue.stop(None);
    }
}
