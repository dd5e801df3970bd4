//! robe client binary: perform one task and print its result.
//!
//! Usage: `robe-client <task> [json-args]`

use std::time::Duration;

use anyhow::Context;
use robe_client::{ClientConfig, RobeClient};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const RESPONSE_WAIT: Duration = Duration::from_secs(120);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("robe_client=info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let task = args
        .next()
        .context("usage: robe-client <task> [json-args]")?;
    let task_args: Value = match args.next() {
        Some(raw) => serde_json::from_str(&raw).context("arguments must be JSON")?,
        None => Value::Null,
    };

    let config = ClientConfig::from_env()?;
    tracing::info!(url = %config.url, %task, "Connecting");
    let client = RobeClient::connect(&config)?;

    let outcome = tokio::time::timeout(RESPONSE_WAIT, client.tasks().perform(&task, &task_args, false))
        .await
        .context("no response from server")?;
    client.close();

    match outcome {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Err(e) => anyhow::bail!("task `{}` failed: {}", task, e),
    }
}
