//! HTTP API server
//!
//! One WebSocket endpoint per device channel plus a health probe.

pub mod ws;

use std::sync::Arc;

use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::Result;
use crate::session::SessionManager;

/// Shared state for API handlers
pub struct ApiState {
    /// Session registry
    pub manager: Arc<SessionManager>,
}

/// Assemble the full router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .merge(ws::router(state))
        .layer(TraceLayer::new_for_http())
}

/// Liveness probe
async fn health() -> &'static str {
    "ok"
}

/// Bind and serve until the process is stopped
///
/// # Errors
///
/// Returns error if the listener cannot bind or the server fails.
pub async fn serve(port: u16, manager: Arc<SessionManager>) -> Result<()> {
    let state = Arc::new(ApiState { manager });
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "gateway listening");
    axum::serve(listener, app).await?;
    Ok(())
}
