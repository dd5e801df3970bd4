//! Application state shared across socket connections.

use std::sync::Arc;

use robe_shared::{Auth, SignatureAuth};

use crate::broker::Broker;
use crate::clients::ConnectionRegistry;
use crate::config::ServerConfig;
use crate::pool::{PoolConfig, WorkerPool};
use crate::tasks::{Dispatcher, TaskRegistry};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub broker: Broker,
    pub clients: ConnectionRegistry,
    pub auth: Arc<dyn Auth>,
}

impl AppState {
    pub fn new(config: &ServerConfig, registry: TaskRegistry) -> anyhow::Result<Self> {
        let auth: Arc<dyn Auth> = match &config.auth_seed {
            Some(seed) => Arc::new(SignatureAuth::from_hex_seed(seed).map_err(anyhow::Error::msg)?),
            None => {
                tracing::warn!("ROBE_AUTH_SEED not set, signatures will not survive a restart");
                Arc::new(SignatureAuth::generate())
            }
        };
        Ok(Self::with_auth(config, registry, auth))
    }

    pub fn with_auth(config: &ServerConfig, registry: TaskRegistry, auth: Arc<dyn Auth>) -> Self {
        let pool = WorkerPool::new(PoolConfig {
            min_threads: config.min_threads,
            max_threads: config.max_threads,
            queue_depth: config.queue_depth,
            ..PoolConfig::default()
        });
        let dispatcher = Dispatcher::new(
            Arc::new(registry),
            Arc::new(pool),
            Arc::clone(&auth),
            config.task_timeout,
        );

        Self {
            dispatcher: Arc::new(dispatcher),
            broker: Broker::new(),
            clients: ConnectionRegistry::new(),
            auth,
        }
    }
}
