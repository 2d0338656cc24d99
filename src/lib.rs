pub mod auth;
pub mod bridge;
pub mod config;
pub mod directory;
pub mod error;
pub mod events;
pub mod gateway;
pub mod handlers;
pub mod jsonrpc;
pub mod session;
pub mod state;
pub mod watchdog;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::get;

use state::AppState;

/// Largest accepted request body.
pub const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Build the application router with the given state.
/// Extracted from `main()` so integration tests can construct the app
/// without binding to a network port.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health
        .route("/api/health", get(handlers::health))
        .route("/api/health/ready", get(handlers::readiness))
        // MCP transports
        .merge(gateway::routes())
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        // Shared state
        .with_state(state)
}
