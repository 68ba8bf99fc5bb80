//! Operator verbs: create, list, describe and restore backups.
//!
//! Every verb checks management leadership before touching the
//! coordinator. Operations run on their own task so a client that hangs up
//! mid-upload or mid-restore does not abort the workflow.

use super::error::ApiError;
use super::AppState;
use crate::arbiter::{LeaseRecord, OperationKind};
use crate::coordinator::{RestoreOptions, RestoreOutcome, SnapshotCoordinator};
use crate::index::BackupRecord;
use crate::leadership::ensure_leader;
use crate::utils::errors::CoordinatorError;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use bytes::Bytes;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Run `op` on its own task, tracked for cancellation until it finishes.
async fn run_tracked<T, F, Fut>(state: &AppState, kind: OperationKind, op: F) -> Result<T, ApiError>
where
    F: FnOnce(Arc<SnapshotCoordinator>, CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, CoordinatorError>> + Send + 'static,
    T: Send + 'static,
{
    let Some((id, token)) = state.operations.register(kind).await else {
        return Err(CoordinatorError::Busy(format!("{kind} refused: node is shutting down")).into());
    };
    let tracker = state.operations.clone();
    let fut = op(state.coordinator.clone(), token);
    let handle = tokio::spawn(async move {
        let result = fut.await;
        tracker.complete(&id).await;
        result
    });

    match handle.await {
        Ok(result) => Ok(result?),
        Err(e) => Err(ApiError::Internal(format!("{kind} task failed: {e}"))),
    }
}

/// POST /backups
pub async fn create_backup(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<BackupRecord>), ApiError> {
    ensure_leader(state.leadership.as_ref()).await?;
    tracing::info!("Backup requested");

    let record = run_tracked(&state, OperationKind::Backup, |coordinator, token| async move {
        coordinator.create_backup(&token).await
    })
    .await?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// GET /backups
pub async fn list_backups(
    State(state): State<AppState>,
) -> Result<Json<Vec<BackupRecord>>, ApiError> {
    ensure_leader(state.leadership.as_ref()).await?;
    Ok(Json(state.coordinator.list_backups().await?))
}

/// GET /backups/{id}
pub async fn describe_backup(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<BackupRecord>, ApiError> {
    ensure_leader(state.leadership.as_ref()).await?;
    Ok(Json(state.coordinator.describe_backup(&id).await?))
}

/// POST /backups/{id}/restore, body `{ "allow_regression": bool }` (optional)
pub async fn restore_backup(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<RestoreOutcome>, ApiError> {
    ensure_leader(state.leadership.as_ref()).await?;
    let options: RestoreOptions = if body.is_empty() {
        RestoreOptions::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("invalid restore options: {e}")))?
    };
    tracing::info!(id = %id, allow_regression = options.allow_regression, "Restore requested");

    let outcome = run_tracked(&state, OperationKind::Restore, move |coordinator, token| async move {
        coordinator.restore(&id, options, &token).await
    })
    .await?;
    Ok(Json(outcome))
}

/// GET /lease
pub async fn current_lease(
    State(state): State<AppState>,
) -> Result<Json<Option<LeaseRecord>>, ApiError> {
    Ok(Json(state.coordinator.current_lease().await?))
}

/// POST /operations/cancel
pub async fn cancel_operations(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let signalled = state.operations.cancel_all().await;
    if signalled == 0 {
        tracing::warn!("Cancel requested but nothing is running");
        return Err(ApiError::NotFound("no operation is running on this node".into()));
    }
    Ok(Json(json!({ "status": "cancelling", "operations": signalled })))
}
