//! Per-destination circuit breaker.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use dispatch_core::{BreakerConfig, BreakerSnapshot, CircuitState, JobEvent, QueueName};
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Returned by [`CircuitBreaker::allow`] when no call may be made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Circuit open for {destination}")]
pub struct CircuitOpen {
    pub destination: QueueName,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    /// Failures since the last success, oldest first.
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Fail-fast gate in front of one destination.
///
/// Shared by every worker calling the destination. Callers get a [`Permit`]
/// from [`allow`](Self::allow) and resolve it with the call's outcome.
#[derive(Debug)]
pub struct CircuitBreaker {
    destination: QueueName,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    event_tx: Option<broadcast::Sender<JobEvent>>,
}

impl CircuitBreaker {
    pub fn new(destination: QueueName, config: BreakerConfig) -> Self {
        Self {
            destination,
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                trial_in_flight: false,
            }),
            event_tx: None,
        }
    }

    /// Set the event broadcaster.
    pub fn with_event_tx(mut self, tx: broadcast::Sender<JobEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn destination(&self) -> QueueName {
        self.destination
    }

    /// Ask to make one call.
    ///
    /// While open, the first caller after `open_timeout` moves the circuit to
    /// half-open and receives the only trial permit; everyone else is denied
    /// until the trial resolves.
    pub fn allow(self: &Arc<Self>) -> Result<Permit, CircuitOpen> {
        let mut inner = self.lock();
        let denied = CircuitOpen {
            destination: self.destination,
        };

        let trial = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .is_none_or(|opened| opened.elapsed() >= self.config.open_timeout);
                if !cooled {
                    return Err(denied);
                }
                self.transition(&mut inner, CircuitState::HalfOpen);
                inner.trial_in_flight = true;
                true
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    return Err(denied);
                }
                inner.trial_in_flight = true;
                true
            }
        };

        Ok(Permit {
            breaker: Arc::clone(self),
            trial,
            resolved: false,
        })
    }

    /// Current state without triggering the open → half-open transition.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        let now = Instant::now();
        let consecutive_failures = inner
            .failures
            .iter()
            .filter(|at| now.duration_since(**at) <= self.config.window)
            .count() as u32;
        BreakerSnapshot {
            destination: self.destination,
            state: inner.state,
            consecutive_failures,
            trial_in_flight: inner.trial_in_flight,
        }
    }

    fn record_success(&self, trial: bool) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::HalfOpen if trial => {
                inner.trial_in_flight = false;
                inner.failures.clear();
                inner.opened_at = None;
                self.transition(&mut inner, CircuitState::Closed);
            }
            CircuitState::Closed => inner.failures.clear(),
            // Late results from calls admitted before the circuit opened.
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn record_failure(&self, trial: bool) {
        let mut inner = self.lock();
        let now = Instant::now();
        match inner.state {
            CircuitState::HalfOpen if trial => {
                inner.trial_in_flight = false;
                inner.opened_at = Some(now);
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Closed => {
                inner.failures.push_back(now);
                while let Some(oldest) = inner.failures.front() {
                    if now.duration_since(*oldest) > self.config.window {
                        inner.failures.pop_front();
                    } else {
                        break;
                    }
                }
                if inner.failures.len() as u32 >= self.config.failure_threshold {
                    inner.opened_at = Some(now);
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn release_trial(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;

        match to {
            CircuitState::Open => tracing::warn!(
                destination = %self.destination,
                failures = inner.failures.len(),
                "Circuit {} -> {}",
                from,
                to
            ),
            _ => tracing::info!(destination = %self.destination, "Circuit {} -> {}", from, to),
        }

        if let Some(ref tx) = self.event_tx {
            let _ = tx.send(JobEvent::BreakerStateChanged {
                destination: self.destination,
                from,
                to,
                timestamp: Utc::now(),
            });
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Permission to make one call through a [`CircuitBreaker`].
///
/// Resolve it with [`success`](Self::success) or [`failure`](Self::failure).
/// Dropping it unresolved (the call was abandoned) records nothing but frees
/// the half-open trial slot.
#[derive(Debug)]
#[must_use = "a permit must be resolved with success() or failure()"]
pub struct Permit {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    resolved: bool,
}

impl Permit {
    /// Whether this permit is the half-open trial.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.record_success(self.trial);
    }

    pub fn failure(mut self) {
        self.resolved = true;
        self.breaker.record_failure(self.trial);
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if !self.resolved && self.trial {
            self.breaker.release_trial();
        }
    }
}
