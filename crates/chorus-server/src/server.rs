//! Axum router: WebSocket upgrade, liveness and stats.

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use chorus_core::ConnectionId;
use chorus_relay::{Inbound, RelayEngine};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::health::{self, LivenessResponse, StatsResponse};
use crate::transport::{self, TransportConfig};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Relay engine of this process.
    pub engine: Arc<RelayEngine>,
    /// Feeds the relay dispatcher.
    pub inbound: mpsc::Sender<Inbound>,
    /// Per-connection transport settings.
    pub transport: TransportConfig,
    /// Cancelled when the process starts draining.
    pub shutdown: CancellationToken,
}

/// Build the router for `/ws`, `/liveness` and `/stats`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/liveness", get(liveness_handler))
        .route("/stats", get(stats_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /ws
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    if state.shutdown.is_cancelled() || state.engine.registry().is_closed().await {
        debug!("upgrade refused while draining");
        return (StatusCode::SERVICE_UNAVAILABLE, "draining").into_response();
    }
    let id = ConnectionId::new();
    ws.on_upgrade(move |socket| {
        transport::run_ws_session(socket, id, state.transport, state.inbound, state.shutdown)
    })
}

/// GET /liveness
async fn liveness_handler() -> Json<LivenessResponse> {
    Json(health::liveness())
}

/// GET /stats
async fn stats_handler(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(health::stats(&state.engine).await)
}
