//! API error mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use quiver_core::error::QuiverError;
use serde_json::json;
use tracing::error;

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Wrapper mapping the platform error taxonomy onto HTTP status codes.
#[derive(Debug)]
pub struct ApiError(pub QuiverError);

impl From<QuiverError> for ApiError {
    fn from(e: QuiverError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            QuiverError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            QuiverError::NotFound { .. } => StatusCode::NOT_FOUND,
            QuiverError::Conflict(_)
            | QuiverError::InvalidStateTransition { .. }
            | QuiverError::Canceled => StatusCode::CONFLICT,
            QuiverError::CapacityExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            QuiverError::Unavailable(_) | QuiverError::Timeout(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self.0, "Unexpected API error");
            // Details go to the log, not the caller.
            return (status, Json(json!({"error": "internal error"}))).into_response();
        }
        (status, Json(json!({"error": self.0.to_string()}))).into_response()
    }
}
