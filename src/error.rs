//! Engine error types and their HTTP mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use tracing::error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Failures of a single engine operation.
///
/// None of these are retried internally; the caller owns retry policy
/// (for example, letting a webhook sender redeliver).
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed or self-contradictory event.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Duplicate id: {0}")]
    DuplicateId(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A second resolve of the same incident.
    #[error("Incident already resolved: {0}")]
    AlreadyResolved(String),

    /// A timestamp that would break an ordering invariant on an existing event.
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    /// The durable event log failed.
    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl EngineError {
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::DuplicateId(_) => "duplicate_id",
            Self::NotFound(_) => "not_found",
            Self::AlreadyResolved(_) => "already_resolved",
            Self::InvalidTimestamp(_) => "invalid_timestamp",
            Self::Storage(_) => "storage_error",
        }
    }

    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::InvalidTimestamp(_) => StatusCode::BAD_REQUEST,
            Self::DuplicateId(_) | Self::AlreadyResolved(_) => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Storage details stay in the logs
        let message = match &self {
            Self::Storage(e) => {
                error!(error = %e, "Storage failure");
                "Internal storage error".to_owned()
            }
            other => other.to_string(),
        };

        let body = json!({
            "error": {
                "code": self.error_type(),
                "message": message,
            }
        });

        (status, Json(body)).into_response()
    }
}
