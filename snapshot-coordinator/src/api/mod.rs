//! Operator HTTP API.

pub mod backups;
pub mod error;
pub mod health;
pub mod operations;

use crate::coordinator::SnapshotCoordinator;
use crate::leadership::Leadership;
use axum::{
    routing::{get, post},
    Router,
};
use operations::OperationTracker;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<SnapshotCoordinator>,
    pub leadership: Arc<dyn Leadership>,
    pub operations: OperationTracker,
}

impl AppState {
    pub fn new(coordinator: Arc<SnapshotCoordinator>, leadership: Arc<dyn Leadership>) -> Self {
        Self {
            coordinator,
            leadership,
            operations: OperationTracker::new(),
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/version", get(health::version))
        .route("/lease", get(backups::current_lease))
        .route(
            "/backups",
            get(backups::list_backups).post(backups::create_backup),
        )
        .route("/backups/{id}", get(backups::describe_backup))
        .route("/backups/{id}/restore", post(backups::restore_backup))
        .route("/operations/cancel", post(backups::cancel_operations))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
