//! Destination client trait and registry.

use dispatch_core::{CallResponse, Job, QueueName};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// How a destination call failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// Worth trying again later: timeouts, 5xx, network errors.
    #[error("Retryable: {0}")]
    Retryable(String),

    /// Will never succeed: 4xx, malformed payload.
    #[error("Non-retryable: {0}")]
    NonRetryable(String),
}

impl ClientError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable(message.into())
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self::NonRetryable(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Retryable(message) | Self::NonRetryable(message) => message,
        }
    }
}

/// Result type for destination calls.
pub type CallResult = Result<CallResponse, ClientError>;

/// Future type for async destination calls.
pub type CallFuture<'a> = Pin<Box<dyn Future<Output = CallResult> + Send + 'a>>;

/// A collaborator that delivers jobs to one destination.
///
/// Implementations receive the whole job, so they can use its id and attempt
/// for idempotency on their side.
pub trait Client: Send + Sync + 'static {
    /// The queue whose jobs this client delivers.
    fn destination(&self) -> QueueName;

    /// Deliver one job.
    fn call<'a>(&'a self, job: &'a Job) -> CallFuture<'a>;
}

/// Maps queues to their clients.
#[derive(Default, Clone)]
pub struct ClientRegistry {
    clients: HashMap<QueueName, Arc<dyn Client>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: HashMap::new(),
        }
    }

    /// Register a client, replacing any earlier one for the same destination.
    pub fn register<C: Client>(&mut self, client: C) {
        self.clients.insert(client.destination(), Arc::new(client));
    }

    /// Builder form of [`register`](Self::register).
    pub fn with<C: Client>(mut self, client: C) -> Self {
        self.register(client);
        self
    }

    pub fn get(&self, queue: QueueName) -> Option<Arc<dyn Client>> {
        self.clients.get(&queue).cloned()
    }

    pub fn has_client(&self, queue: QueueName) -> bool {
        self.clients.contains_key(&queue)
    }

    pub fn destinations(&self) -> Vec<QueueName> {
        QueueName::ALL
            .into_iter()
            .filter(|queue| self.has_client(*queue))
            .collect()
    }
}

/// A client built from a closure.
pub struct FnClient<F>
where
    F: Fn(Job) -> CallFuture<'static> + Send + Sync + 'static,
{
    destination: QueueName,
    call: F,
}

impl<F> FnClient<F>
where
    F: Fn(Job) -> CallFuture<'static> + Send + Sync + 'static,
{
    pub fn new(destination: QueueName, call: F) -> Self {
        Self { destination, call }
    }
}

impl<F> Client for FnClient<F>
where
    F: Fn(Job) -> CallFuture<'static> + Send + Sync + 'static,
{
    fn destination(&self) -> QueueName {
        self.destination
    }

    fn call<'a>(&'a self, job: &'a Job) -> CallFuture<'a> {
        (self.call)(job.clone())
    }
}

/// Build a [`FnClient`] from an async block.
#[macro_export]
macro_rules! client_fn {
    ($destination:expr, |$job:ident| $body:expr) => {
        $crate::FnClient::new($destination, |$job: ::dispatch_core::Job| {
            Box::pin(async move { $body })
        })
    };
}
