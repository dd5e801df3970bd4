//! Server configuration from environment variables.

use std::net::SocketAddr;
use std::time::Duration;

/// Runtime settings for the socket endpoint and the task worker pool.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Deadline wrapped around every task execution.
    pub task_timeout: Duration,
    pub min_threads: usize,
    pub max_threads: usize,
    /// Jobs allowed to wait for a worker before submissions are rejected.
    pub queue_depth: usize,
    /// Hex encoded 32 byte Ed25519 seed for user signatures.
    pub auth_seed: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            task_timeout: Duration::from_secs(60),
            min_threads: 1,
            max_threads: 16,
            queue_depth: 1024,
            auth_seed: None,
        }
    }
}

impl ServerConfig {
    /// Parse configuration from environment variables.
    ///
    /// Environment variables:
    /// - `ROBE_BIND_ADDR`: listen address (default: "0.0.0.0:8080")
    /// - `ROBE_TASK_TIMEOUT_SECS`: per-task deadline (default: 60)
    /// - `ROBE_MIN_THREADS` / `ROBE_MAX_THREADS`: worker pool bounds (default: 1 / 16)
    /// - `ROBE_TASK_QUEUE_DEPTH`: waiting jobs before rejection (default: 1024)
    /// - `ROBE_AUTH_SEED`: hex Ed25519 seed (default: random per process)
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let bind_addr = match std::env::var("ROBE_BIND_ADDR") {
            Ok(addr) => addr.parse()?,
            Err(_) => defaults.bind_addr,
        };
        let task_timeout = Duration::from_secs(env_or("ROBE_TASK_TIMEOUT_SECS", 60)?);
        let min_threads = env_or("ROBE_MIN_THREADS", defaults.min_threads)?;
        let max_threads = env_or("ROBE_MAX_THREADS", defaults.max_threads)?;
        let queue_depth = env_or("ROBE_TASK_QUEUE_DEPTH", defaults.queue_depth)?;

        if min_threads == 0 || max_threads < min_threads {
            anyhow::bail!(
                "invalid worker bounds: min {} / max {}",
                min_threads,
                max_threads
            );
        }

        Ok(Self {
            bind_addr,
            task_timeout,
            min_threads,
            max_threads,
            queue_depth,
            auth_seed: std::env::var("ROBE_AUTH_SEED").ok(),
        })
    }
}

fn env_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{} is invalid: {}", key, e)),
        Err(_) => Ok(default),
    }
}
