use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::pipeline::errors::PipelineError;

/// Application-level error type.
/// Implements `IntoResponse` so Axum handlers can return `Result<T, AppError>`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            AppError::Pipeline(e @ PipelineError::DataSourceUnavailable(_)) => {
                tracing::error!("Pipeline error: {e}");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "DATA_SOURCE_UNAVAILABLE",
                    "A backing store is unavailable".to_string(),
                )
            }
            AppError::Pipeline(e @ PipelineError::ConcurrencyConflict(_)) => {
                (StatusCode::CONFLICT, "ROUND_IN_PROGRESS", e.to_string())
            }
            AppError::Pipeline(e @ PipelineError::InvalidReference(_)) => {
                (StatusCode::BAD_REQUEST, "INVALID_REFERENCE", e.to_string())
            }
            AppError::Pipeline(e) => {
                tracing::error!("Pipeline error: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal server error occurred".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message
            }
        }));

        (status, body).into_response()
    }
}
