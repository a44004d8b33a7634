//! Health check endpoints.

use axum::{
    extract::State,
    http::StatusCode,
    Json,
};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Basic health check (is the server running?)
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
pub struct ReadyResponse {
    status: &'static str,
    store: bool,
}

/// Readiness check (does the shared store answer?)
pub async fn ready_check(
    State(state): State<AppState>,
) -> Result<Json<ReadyResponse>, StatusCode> {
    if state.store_ready().await {
        Ok(Json(ReadyResponse {
            status: "ready",
            store: true,
        }))
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}

#[derive(Serialize)]
pub struct StatusResponse {
    server: String,
    is_leader: bool,
    servers: Vec<String>,
    masters: Vec<String>,
    connections: usize,
    current_sequence: Option<u64>,
    cached_resources: u64,
}

/// Cluster view of this server
pub async fn status(
    State(state): State<AppState>,
) -> Json<StatusResponse> {
    let view = state.leader.view().await;

    Json(StatusResponse {
        server: state.leader.server().to_string(),
        is_leader: state.leader.is_leader().await,
        servers: view.servers.into_iter().collect(),
        masters: view.masters.into_iter().collect(),
        connections: state.hub.connected().await,
        current_sequence: state.current_sequence().await,
        cached_resources: state.cache.entry_count(),
    })
}
