//! Supervisor actor owning queues, workers and the scheduler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use db::JobStore;
use dispatch_core::{DispatchConfig, JobEvent, QueueName};
use futures_util::future::join_all;
use ractor::{Actor, ActorId, ActorProcessingErr, ActorRef, SupervisionEvent};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::breaker::CircuitBreaker;
use crate::client::ClientRegistry;
use crate::messages::{QueueMessage, SchedulerMessage, SupervisorMessage, Topology, WorkerMessage, ask};
use crate::queue_actor::{QueueActor, QueueActorState};
use crate::rate_limiter::RateLimiter;
use crate::scheduler::{SchedulerActor, SchedulerArgs};
use crate::worker_actor::{Destination, WorkerActor, WorkerArgs};

const EVENT_CAPACITY: usize = 1024;

/// Supervisor actor arguments.
pub struct SupervisorArgs {
    pub config: DispatchConfig,
    pub clients: ClientRegistry,
    pub store: Arc<dyn JobStore>,
}

struct WorkerSlot {
    worker_id: String,
    queue: QueueName,
    actor: ActorRef<WorkerMessage>,
}

/// State for the supervisor actor.
pub struct SupervisorState {
    config: DispatchConfig,
    queues: HashMap<QueueName, ActorRef<QueueMessage>>,
    workers: HashMap<ActorId, WorkerSlot>,
    scheduler: Option<ActorRef<SchedulerMessage>>,
    destinations: HashMap<QueueName, Destination>,
    breakers: HashMap<QueueName, Arc<CircuitBreaker>>,
    limiters: HashMap<QueueName, Arc<RateLimiter>>,
    event_tx: broadcast::Sender<JobEvent>,
    cancel: CancellationToken,
    /// Worker counter for unique IDs.
    worker_counter: u64,
}

impl SupervisorState {
    fn new(config: DispatchConfig, clients: &ClientRegistry) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let mut breakers = HashMap::new();
        let mut limiters = HashMap::new();
        for queue in QueueName::ALL {
            let queue_config = config.queue(queue);
            if let Some(breaker) = &queue_config.circuit_breaker {
                let breaker = CircuitBreaker::new(queue, breaker.clone()).with_event_tx(event_tx.clone());
                breakers.insert(queue, Arc::new(breaker));
            }
            if let Some(limit) = &queue_config.rate_limit {
                limiters.insert(queue, Arc::new(RateLimiter::new(queue, limit)));
            }
        }

        let destinations = QueueName::ALL
            .into_iter()
            .filter_map(|queue| {
                let client = clients.get(queue)?;
                Some((
                    queue,
                    Destination {
                        client,
                        limiter: limiters.get(&queue).cloned(),
                        breaker: breakers.get(&queue).cloned(),
                    },
                ))
            })
            .collect();

        Self {
            config,
            queues: HashMap::new(),
            workers: HashMap::new(),
            scheduler: None,
            destinations,
            breakers,
            limiters,
            event_tx,
            cancel: CancellationToken::new(),
            worker_counter: 0,
        }
    }

    /// Generate a unique worker ID.
    fn next_worker_id(&mut self, queue: QueueName) -> String {
        self.worker_counter += 1;
        format!("{}-worker-{}", queue, self.worker_counter)
    }

    fn topology(&self) -> Topology {
        Topology {
            queues: self.queues.clone(),
            breakers: self.breakers.clone(),
            limiters: self.limiters.clone(),
            event_tx: self.event_tx.clone(),
        }
    }

    /// Bound on how long a stopping child may take.
    fn stop_timeout(&self) -> Duration {
        self.config.rpc_timeout.saturating_mul(2)
    }
}

async fn spawn_worker(
    myself: &ActorRef<SupervisorMessage>,
    state: &mut SupervisorState,
    queue: QueueName,
) -> Result<(), ActorProcessingErr> {
    let (Some(destination), Some(queue_ref)) =
        (state.destinations.get(&queue).cloned(), state.queues.get(&queue).cloned())
    else {
        return Ok(());
    };

    let worker_id = state.next_worker_id(queue);
    let args = WorkerArgs {
        worker_id: worker_id.clone(),
        queue,
        queue_ref,
        config: state.config.queue(queue).clone(),
        destination,
        cancel: state.cancel.clone(),
        rpc_timeout: state.config.rpc_timeout,
        event_tx: Some(state.event_tx.clone()),
    };

    let (actor, _handle) = Actor::spawn_linked(None, WorkerActor, args, myself.get_cell())
        .await
        .map_err(|e| ActorProcessingErr::from(format!("Failed to spawn worker: {}", e)))?;

    state.workers.insert(
        actor.get_id(),
        WorkerSlot {
            worker_id,
            queue,
            actor,
        },
    );
    Ok(())
}

/// Spawn queues, then workers, then the scheduler.
async fn start_children(
    myself: &ActorRef<SupervisorMessage>,
    state: &mut SupervisorState,
    store: &Arc<dyn JobStore>,
) -> Result<(), ActorProcessingErr> {
    for queue in QueueName::ALL {
        let queue_state = QueueActorState::new(queue, Arc::clone(store))
            .with_event_tx(state.event_tx.clone())
            .with_dedupe_window(state.config.dedupe_window);
        let (actor, _handle) =
            Actor::spawn_linked(None, QueueActor, queue_state, myself.get_cell())
                .await
                .map_err(|e| ActorProcessingErr::from(format!("Failed to spawn queue {}: {}", queue, e)))?;
        state.queues.insert(queue, actor);
    }

    for queue in QueueName::ALL {
        if !state.destinations.contains_key(&queue) {
            tracing::warn!("No client registered for {}; jobs will wait", queue);
            continue;
        }
        for _ in 0..state.config.queue(queue).workers {
            spawn_worker(myself, state, queue).await?;
        }
    }

    if !state.config.schedules.is_empty() {
        let args = SchedulerArgs {
            schedules: state.config.schedules.clone(),
            queues: state.queues.clone(),
            tick: state.config.scheduler_tick,
            rpc_timeout: state.config.rpc_timeout,
            cancel: state.cancel.clone(),
            event_tx: Some(state.event_tx.clone()),
        };
        let (scheduler, _handle) =
            Actor::spawn_linked(None, SchedulerActor, args, myself.get_cell())
                .await
                .map_err(|e| ActorProcessingErr::from(format!("Failed to spawn scheduler: {}", e)))?;
        state.scheduler = Some(scheduler);
    }
    Ok(())
}

/// Supervisor actor that manages all queues.
pub struct Supervisor;

impl Actor for Supervisor {
    type Msg = SupervisorMessage;
    type State = SupervisorState;
    type Arguments = SupervisorArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting dispatch supervisor");
        let mut state = SupervisorState::new(args.config, &args.clients);

        if let Err(e) = start_children(&myself, &mut state, &args.store).await {
            state.cancel.cancel();
            for slot in state.workers.values() {
                slot.actor.stop(None);
            }
            for queue_ref in state.queues.values() {
                queue_ref.stop(None);
            }
            return Err(e);
        }

        // Start periodic reaper tick
        let myself_clone = myself.clone();
        let cancel = state.cancel.clone();
        let reap_interval = state.config.reap_interval;
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + reap_interval;
            let mut interval = tokio::time::interval_at(start, reap_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if myself_clone.send_message(SupervisorMessage::Tick).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        tracing::info!(
            queues = state.queues.len(),
            workers = state.workers.len(),
            schedules = state.config.schedules.len(),
            "Dispatch supervisor started"
        );
        Ok(state)
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisorMessage::GetTopology { reply } => {
                let _ = reply.send(state.topology());
            }

            SupervisorMessage::ReapNow { reply } => {
                let timeout = state.config.rpc_timeout;
                let reaped = join_all(state.queues.values().map(|queue_ref| {
                    ask(
                        queue_ref,
                        |reply| QueueMessage::ReapExpiredLeases { reply: Some(reply) },
                        timeout,
                    )
                }))
                .await;
                let total: usize = reaped
                    .into_iter()
                    .filter_map(|result| match result {
                        Ok(count) => Some(count),
                        Err(e) => {
                            tracing::warn!("Reap failed: {}", e);
                            None
                        }
                    })
                    .sum();
                let _ = reply.send(total);
            }

            SupervisorMessage::Tick => {
                for queue_ref in state.queues.values() {
                    let _ = queue_ref.send_message(QueueMessage::ReapExpiredLeases { reply: None });
                }
            }

            SupervisorMessage::Shutdown { reply } => {
                tracing::info!("Shutting down dispatch supervisor");
                state.cancel.cancel();
                let timeout = state.stop_timeout();

                // Workers first, while their queues can still take reports.
                let workers: Vec<WorkerSlot> = state.workers.drain().map(|(_, slot)| slot).collect();
                join_all(workers.iter().map(|slot| slot.actor.stop_and_wait(None, Some(timeout)))).await;

                if let Some(scheduler) = state.scheduler.take() {
                    let _ = scheduler.stop_and_wait(None, Some(timeout)).await;
                }
                join_all(state.queues.values().map(|queue_ref| queue_ref.stop_and_wait(None, Some(timeout)))).await;

                let _ = reply.send(());
                myself.stop(None);
            }
        }

        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        myself: ActorRef<Self::Msg>,
        message: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisionEvent::ActorFailed(cell, err) => {
                let Some(slot) = state.workers.remove(&cell.get_id()) else {
                    tracing::error!("Child actor {} failed: {}", cell.get_id(), err);
                    return Ok(());
                };
                tracing::error!("Worker {} failed: {}", slot.worker_id, err);
                if !state.cancel.is_cancelled() {
                    // Its lease is left for the reaper.
                    spawn_worker(&myself, state, slot.queue).await?;
                    tracing::info!("Restarted a worker for {}", slot.queue);
                }
            }
            SupervisionEvent::ActorTerminated(cell, _, reason) => {
                if let Some(slot) = state.workers.remove(&cell.get_id()) {
                    tracing::debug!("Worker {} terminated: {:?}", slot.worker_id, reason);
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        state.cancel.cancel();
        tracing::info!("Dispatch supervisor stopped");
        Ok(())
    }
}
