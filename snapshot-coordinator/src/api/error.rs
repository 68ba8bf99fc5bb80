use crate::utils::errors::CoordinatorError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Internal(String),
}

pub fn status_for(err: &CoordinatorError) -> StatusCode {
    match err {
        CoordinatorError::Busy(_) | CoordinatorError::Cancelled(_) => StatusCode::CONFLICT,
        CoordinatorError::NotLeader => StatusCode::MISDIRECTED_REQUEST,
        CoordinatorError::NotQuorate(_)
        | CoordinatorError::WriteInFlight(_)
        | CoordinatorError::TransientIo(_) => StatusCode::SERVICE_UNAVAILABLE,
        CoordinatorError::NotFound(_) => StatusCode::NOT_FOUND,
        CoordinatorError::Auth(_) => StatusCode::BAD_GATEWAY,
        CoordinatorError::Failed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        CoordinatorError::Config(_) => StatusCode::BAD_REQUEST,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, retryable) = match &self {
            ApiError::Coordinator(e) => (status_for(e), e.kind(), e.is_retryable()),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request", false),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found", false),
            ApiError::Internal(m) => {
                tracing::error!("Internal error: {m}");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal", false)
            }
        };
        (
            status,
            Json(json!({
                "error": kind,
                "message": self.to_string(),
                "retryable": retryable,
            })),
        )
            .into_response()
    }
}
