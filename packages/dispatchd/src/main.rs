//! Deployment notification dispatch daemon.
//!
//! Reads `dispatch.toml` (or the file named by `DISPATCH_CONFIG`), overlaid
//! with `DISPATCH_` environment variables, and runs the dispatcher until
//! Ctrl-C.

use std::error::Error;
use std::sync::Arc;

use actors::{ClientError, ClientRegistry, DispatchHandle, client_fn};
use db::{DbConfig, SurrealStore};
use dispatch_core::{CallResponse, DispatchConfig, JobEvent, QueueName};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "dispatch.toml";

/// Where jobs are persisted.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct StoreSettings {
    endpoint: String,
    namespace: String,
    database: String,
    username: Option<String>,
    password: Option<String>,
}

impl Default for StoreSettings {
    fn default() -> Self {
        let db = DbConfig::default();
        Self {
            endpoint: db.endpoint,
            namespace: db.namespace,
            database: db.database,
            username: None,
            password: None,
        }
    }
}

impl StoreSettings {
    fn db_config(&self) -> DbConfig {
        let config = DbConfig {
            endpoint: self.endpoint.clone(),
            ..DbConfig::default()
        }
        .with_namespace(&self.namespace)
        .with_database(&self.database);
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => config.with_credentials(username, password),
            _ => config,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct DaemonConfig {
    dispatch: DispatchConfig,
    store: StoreSettings,
}

fn load_config() -> Result<DaemonConfig, figment::Error> {
    let path = std::env::var("DISPATCH_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    Figment::new()
        .merge(Toml::file(path))
        .merge(Env::prefixed("DISPATCH_").split("__").lowercase(true))
        .extract()
}

/// Clients that log the payload and report success.
///
/// Real deployments register their Jira, Slack and metrics clients here.
fn clients() -> ClientRegistry {
    QueueName::ALL
        .into_iter()
        .fold(ClientRegistry::new(), |registry, queue| {
            registry.with(client_fn!(queue, |job| {
                if job.payload.get("fail").is_some() {
                    return Err(ClientError::non_retryable("payload asked to fail"));
                }
                tracing::info!(queue = %job.queue, job_id = %job.id, attempt = job.attempt, "Delivering {}", job.payload);
                Ok(CallResponse::new(format!("logged {}", job.id)))
            }))
        })
}

fn log_events(dispatch: &DispatchHandle) {
    let mut events = dispatch.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event @ JobEvent::JobDeadLettered { .. }) => {
                    tracing::warn!("{}", event.description());
                }
                Ok(event @ JobEvent::BreakerStateChanged { .. }) => {
                    tracing::warn!("{}", event.description());
                }
                Ok(event) => tracing::debug!("{}", event.description()),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Event log lagged, {} events skipped", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_config()?;
    tracing::info!(endpoint = %config.store.endpoint, "Opening job store");
    let store = SurrealStore::connect(config.store.db_config()).await?;

    let (dispatch, join_handle) = actors::start(config.dispatch, clients(), Arc::new(store)).await?;
    log_events(&dispatch);
    tracing::info!("dispatchd running; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    dispatch.shutdown().await?;
    join_handle.await?;
    tracing::info!("dispatchd stopped");
    Ok(())
}
