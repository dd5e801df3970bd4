//! Client configuration from environment variables.

use std::time::Duration;

use url::Url;

use crate::tasks::RetryConfig;
use crate::ws::ReconnectConfig;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Socket endpoint, `ws://` or `wss://`
    pub url: String,
    pub reconnect: ReconnectConfig,
    pub retry: RetryConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            reconnect: ReconnectConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

const DEFAULT_URL: &str = "ws://localhost:8080/socket";

impl ClientConfig {
    /// Parse configuration from environment variables.
    ///
    /// Environment variables:
    /// - `ROBE_SERVER_URL`: socket endpoint (default: "ws://localhost:8080/socket")
    /// - `ROBE_RECONNECT_INTERVAL_MS`: first reconnect delay (default: 1000)
    /// - `ROBE_RECONNECT_DECAY`: backoff multiplier (default: 1.5)
    /// - `ROBE_MAX_RECONNECT_INTERVAL_MS`: delay cap (default: 30000)
    /// - `ROBE_MAX_RECONNECT_ATTEMPTS`: 0 retries forever (default: 10)
    /// - `ROBE_CONNECT_TIMEOUT_MS`: connect watchdog (default: 2000)
    /// - `ROBE_TASK_SEND_ATTEMPTS`: sends per task while disconnected (default: 10)
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let url = match std::env::var("ROBE_SERVER_URL") {
            Ok(raw) => parse_socket_url(&raw)?.to_string(),
            Err(_) => defaults.url,
        };

        let reconnect = ReconnectConfig {
            reconnect_interval: Duration::from_millis(env_or("ROBE_RECONNECT_INTERVAL_MS", 1000)?),
            reconnect_decay: env_or("ROBE_RECONNECT_DECAY", 1.5)?,
            max_reconnect_interval: Duration::from_millis(env_or(
                "ROBE_MAX_RECONNECT_INTERVAL_MS",
                30_000,
            )?),
            max_reconnect_attempts: env_or("ROBE_MAX_RECONNECT_ATTEMPTS", 10)?,
            connect_timeout: Duration::from_millis(env_or("ROBE_CONNECT_TIMEOUT_MS", 2000)?),
        };
        if !reconnect.reconnect_decay.is_finite() || reconnect.reconnect_decay < 1.0 {
            anyhow::bail!(
                "ROBE_RECONNECT_DECAY must be at least 1.0, got {}",
                reconnect.reconnect_decay
            );
        }

        let retry = RetryConfig {
            max_attempts: env_or("ROBE_TASK_SEND_ATTEMPTS", defaults.retry.max_attempts)?,
            ..defaults.retry
        };

        Ok(Self {
            url,
            reconnect,
            retry,
        })
    }
}

/// Parse `raw` and require a WebSocket scheme.
pub fn parse_socket_url(raw: &str) -> anyhow::Result<Url> {
    let url = Url::parse(raw.trim())?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => anyhow::bail!("unsupported scheme `{}` in {}", other, raw),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_url_scheme_is_checked() {
        assert!(parse_socket_url("ws://localhost:8080/socket").is_ok());
        assert!(parse_socket_url(" wss://example.com/socket ").is_ok());
        assert!(parse_socket_url("http://example.com/socket").is_err());
        assert!(parse_socket_url("not a url").is_err());
    }

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.url, "ws://localhost:8080/socket");
        assert!(parse_socket_url(&config.url).is_ok());
        assert_eq!(config.reconnect.max_reconnect_attempts, 10);
        assert_eq!(config.retry.max_attempts, 10);
    }
}
