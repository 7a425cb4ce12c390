use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::extraction::ExtractError;
use crate::llm_client::GenerationError;

/// Everything that can end a single resume's run.
/// Score-parse and embedding failures never reach this type; they are recovered
/// where they happen.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Text generation failed: {0}")]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Extraction(#[from] ExtractError),

    #[error("Run exceeded its deadline of {0:?}")]
    DeadlineExceeded(Duration),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Serializable classification of a `PipelineError`, recorded per batch entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    UnsupportedFormat,
    CorruptInput,
    Generation,
    DeadlineExceeded,
    Internal,
}

impl PipelineError {
    pub fn kind(&self) -> FailureKind {
        match self {
            PipelineError::Generation(_) => FailureKind::Generation,
            PipelineError::Extraction(ExtractError::UnsupportedFormat(_)) => {
                FailureKind::UnsupportedFormat
            }
            PipelineError::Extraction(ExtractError::CorruptInput(_)) => FailureKind::CorruptInput,
            PipelineError::DeadlineExceeded(_) => FailureKind::DeadlineExceeded,
            PipelineError::Internal(_) => FailureKind::Internal,
        }
    }
}

/// Application-level error type.
/// Implements `IntoResponse` so Axum handlers can return `Result<T, AppError>`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("Unprocessable entity: {0}")]
    UnprocessableEntity(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Maps a failed run onto the HTTP error it should surface as.
    pub fn from_failure(kind: FailureKind, message: String) -> Self {
        match kind {
            FailureKind::UnsupportedFormat => AppError::UnsupportedMediaType(message),
            FailureKind::CorruptInput => AppError::UnprocessableEntity(message),
            FailureKind::Generation => AppError::Llm(message),
            FailureKind::DeadlineExceeded => AppError::Timeout(message),
            FailureKind::Internal => AppError::Internal(anyhow::anyhow!(message)),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::UnsupportedMediaType(msg) => (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "UNSUPPORTED_FORMAT",
                msg.clone(),
            ),
            AppError::UnprocessableEntity(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "UNPROCESSABLE_ENTITY",
                msg.clone(),
            ),
            AppError::Llm(msg) => {
                tracing::error!("LLM error: {msg}");
                (
                    StatusCode::BAD_GATEWAY,
                    "LLM_ERROR",
                    "An AI processing error occurred".to_string(),
                )
            }
            AppError::Timeout(msg) => {
                tracing::error!("Timeout: {msg}");
                (
                    StatusCode::GATEWAY_TIMEOUT,
                    "TIMEOUT",
                    "Processing took too long".to_string(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:?}");
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
