//! robe server: task dispatch and channel fan-out over a single WebSocket
//! endpoint.

use axum::{routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub mod broker;
pub mod clients;
pub mod config;
pub mod pool;
pub mod state;
pub mod tasks;
pub mod ws;

pub use config::ServerConfig;
pub use state::AppState;

/// Path of the socket endpoint.
pub const SOCKET_PATH: &str = "/socket";

/// Build the router serving the socket endpoint.
pub fn router(state: AppState) -> Router {
    // Build CORS layer
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(SOCKET_PATH, get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve `state` on an already bound listener until the process exits.
pub async fn serve(listener: tokio::net::TcpListener, state: AppState) -> std::io::Result<()> {
    axum::serve(listener, router(state)).await
}
