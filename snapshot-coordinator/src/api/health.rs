//! Health check endpoints.

use super::AppState;
use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;
use std::sync::OnceLock;
use std::time::Instant;

static START_TIME: OnceLock<Instant> = OnceLock::new();

pub fn init_start_time() {
    START_TIME.get_or_init(Instant::now);
}

/// GET /health - Liveness, plus the lease tokens held here. Peers read
/// `leases` before reclaiming an expired lease from this node.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = START_TIME.get().map(|t| t.elapsed().as_secs()).unwrap_or(0);

    Json(json!({
        "status": "ok",
        "node_id": state.coordinator.node_id(),
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": uptime,
        "active_operations": state.operations.running().await,
        "leases": state.coordinator.held_leases().await,
    }))
}

/// GET /version - Version information endpoint
pub async fn version() -> impl IntoResponse {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "features": ["zstd", "sha256"],
    }))
}
