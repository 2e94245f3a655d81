//! HTTP-boundary error taxonomy (spec.md §7).
//!
//! Service-layer code returns `anyhow::Result` like the rest of the crate;
//! handlers in [`crate::server`] convert failures into an [`AppError`] and
//! map it to the `{error, message, details}` envelope of spec.md §6.

use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("downstream vendor rate-limited the request")]
    RateLimited,
    #[error("transient I/O failure: {0}")]
    TransientIo(String),
    #[error("extraction failed: {0}")]
    ExtractionFailed(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation_error",
            AppError::Unauthorized => "unauthorized",
            AppError::Forbidden => "forbidden",
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::RateLimited => "rate_limited",
            AppError::TransientIo(_) => "transient_io",
            AppError::ExtractionFailed(_) => "extraction_failed",
            AppError::Internal(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            AppError::Validation(_) => 400,
            AppError::Unauthorized => 401,
            AppError::Forbidden => 403,
            AppError::NotFound(_) => 404,
            AppError::Conflict(_) => 409,
            AppError::RateLimited => 429,
            AppError::TransientIo(_) => 503,
            AppError::ExtractionFailed(_) => 422,
            AppError::Internal(_) => 500,
        }
    }
}

/// `{error, message, details}` envelope (spec.md §6).
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetails {
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl AppError {
    pub fn into_body(self, request_id: Uuid) -> ErrorBody {
        ErrorBody {
            error: self.code().to_string(),
            message: self.to_string(),
            details: Some(ErrorDetails {
                request_id: request_id.to_string(),
                error_type: None,
                error_message: None,
            }),
        }
    }
}
