//! Per-destination token bucket.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dispatch_core::{LimiterSnapshot, QueueName, RateLimitConfig};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why [`RateLimiter::acquire`] did not grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AcquireError {
    #[error("Rate limit not granted within max_wait")]
    Timeout,

    #[error("Rate limit wait cancelled")]
    Cancelled,
}

/// Token bucket with lazy refill.
#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    capacity: u32,
    refill_rate: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, refill_rate: f64) -> Self {
        Self {
            tokens: f64::from(capacity),
            capacity,
            refill_rate,
            last_update: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_update);
        let new_tokens = elapsed.as_secs_f64() * self.refill_rate;
        self.tokens = (self.tokens + new_tokens).min(f64::from(self.capacity));
        self.last_update = now;
    }

    fn try_consume(&mut self, tokens: u32, now: Instant) -> bool {
        self.refill(now);
        let requested = f64::from(tokens);
        if self.tokens >= requested {
            self.tokens -= requested;
            true
        } else {
            false
        }
    }

    /// Time until `tokens` are available, rounded up to whole milliseconds.
    /// `None` when the bucket never refills.
    fn deficit_wait(&self, tokens: u32) -> Option<Duration> {
        if self.refill_rate <= 0.0 {
            return None;
        }
        let deficit = (f64::from(tokens) - self.tokens).max(0.0);
        let millis = (deficit / self.refill_rate * 1000.0).ceil();
        Some(Duration::from_millis(millis as u64).max(Duration::from_millis(1)))
    }
}

/// Rate limiter in front of one destination, shared by all of its workers.
///
/// Waiters queue on a fair async mutex, so they are granted one at a time in
/// arrival order and a later caller can never take tokens an earlier waiter is
/// sleeping for.
#[derive(Debug)]
pub struct RateLimiter {
    destination: QueueName,
    bucket: Mutex<TokenBucket>,
    turnstile: tokio::sync::Mutex<()>,
    max_wait: Duration,
}

impl RateLimiter {
    pub fn new(destination: QueueName, config: &RateLimitConfig) -> Self {
        Self {
            destination,
            bucket: Mutex::new(TokenBucket::new(config.capacity, config.refill_per_sec)),
            turnstile: tokio::sync::Mutex::new(()),
            max_wait: config.max_wait,
        }
    }

    pub fn destination(&self) -> QueueName {
        self.destination
    }

    /// Take `tokens` from the bucket.
    ///
    /// Without `wait` this never sleeps. With `wait` it sleeps for the deficit
    /// and gives up with [`AcquireError::Timeout`] as soon as it is clear the
    /// grant cannot happen within `max_wait`.
    pub async fn acquire(
        &self,
        tokens: u32,
        wait: bool,
        cancel: &CancellationToken,
    ) -> Result<(), AcquireError> {
        if tokens > self.lock().capacity {
            return Err(AcquireError::Timeout);
        }
        if cancel.is_cancelled() {
            return Err(AcquireError::Cancelled);
        }

        if !wait {
            // Queued waiters have first claim on refilled tokens.
            let Ok(_turn) = self.turnstile.try_lock() else {
                return Err(AcquireError::Timeout);
            };
            return match self.lock().try_consume(tokens, Instant::now()) {
                true => Ok(()),
                false => Err(AcquireError::Timeout),
            };
        }

        let deadline = Instant::now() + self.max_wait;
        let _turn = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AcquireError::Cancelled),
            turn = tokio::time::timeout_at(deadline, self.turnstile.lock()) => {
                turn.map_err(|_| AcquireError::Timeout)?
            }
        };

        loop {
            let now = Instant::now();
            let pause = {
                let mut bucket = self.lock();
                if bucket.try_consume(tokens, now) {
                    return Ok(());
                }
                bucket.deficit_wait(tokens)
            };

            let Some(pause) = pause else {
                return Err(AcquireError::Timeout);
            };
            if now + pause > deadline {
                tracing::debug!(
                    destination = %self.destination,
                    wait_ms = pause.as_millis() as u64,
                    "Rate limit grant would exceed max_wait"
                );
                return Err(AcquireError::Timeout);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AcquireError::Cancelled),
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    pub fn snapshot(&self) -> LimiterSnapshot {
        let mut bucket = self.lock();
        bucket.refill(Instant::now());
        LimiterSnapshot {
            destination: self.destination,
            available_tokens: bucket.tokens,
            capacity: bucket.capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TokenBucket> {
        self.bucket.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
