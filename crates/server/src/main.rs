//! robe server binary.

use robe_server::tasks::{builtin::register_builtin_tasks, TaskRegistry};
use robe_server::{AppState, ServerConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "robe_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env()?;

    let registry = TaskRegistry::new();
    register_builtin_tasks(&registry);
    tracing::info!(tasks = ?registry.names(), "Registered tasks");

    let state = AppState::new(&config, registry)?;

    tracing::info!("Starting server on {}", config.bind_addr);
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    robe_server::serve(listener, state).await?;
    Ok(())
}
