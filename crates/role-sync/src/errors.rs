//! Role sync error types.
//!
//! - [`ClaimsError`] - failures talking to the identity claims collaborator.
//!   Recorded per identity, never propagated out of a reconciliation pass.
//! - [`RoleSyncError`] - failures of the HTTP trigger surface, mapped to
//!   status codes via `IntoResponse`. Messages returned to callers are
//!   generic; details are logged server-side.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Identity claims collaborator error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClaimsError {
    #[error("Identity not found")]
    NotFound,

    #[error("Identity service unavailable: {0}")]
    Unavailable(String),

    #[error("Identity service rejected the request with status {0}")]
    Rejected(u16),

    #[error("Invalid identity service response: {0}")]
    InvalidResponse(String),

    #[error("Identity operation timed out")]
    Timeout,

    #[error("Reconciliation deadline exceeded before the identity was processed")]
    DeadlineExceeded,
}

impl ClaimsError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ClaimsError::Unavailable(_))
    }

    /// Bounded label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ClaimsError::NotFound => "not_found",
            ClaimsError::Unavailable(_) => "unavailable",
            ClaimsError::Rejected(_) => "rejected",
            ClaimsError::InvalidResponse(_) => "invalid_response",
            ClaimsError::Timeout => "timeout",
            ClaimsError::DeadlineExceeded => "deadline_exceeded",
        }
    }
}

/// HTTP surface error type.
///
/// Maps to:
/// - InvalidSignature: 401 Unauthorized
/// - BadRequest: 400 Bad Request
/// - Internal: 500 Internal Server Error
#[derive(Debug, Error)]
pub enum RoleSyncError {
    #[error("Invalid trigger signature")]
    InvalidSignature,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal server error")]
    Internal,
}

impl RoleSyncError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RoleSyncError::InvalidSignature => StatusCode::UNAUTHORIZED,
            RoleSyncError::BadRequest(_) => StatusCode::BAD_REQUEST,
            RoleSyncError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

impl IntoResponse for RoleSyncError {
    fn into_response(self) -> Response {
        let (code, message) = match &self {
            RoleSyncError::InvalidSignature => (
                "INVALID_SIGNATURE",
                "Missing or invalid trigger signature".to_string(),
            ),
            RoleSyncError::BadRequest(reason) => ("BAD_REQUEST", reason.clone()),
            RoleSyncError::Internal => ("INTERNAL_ERROR", "An internal error occurred".to_string()),
        };

        let body = ErrorResponse {
            error: ErrorDetail {
                code: code.to_string(),
                message,
            },
        };

        (self.status_code(), Json(body)).into_response()
    }
}
