//! API error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::cache::entry::InvalidObjectId;
use crate::cache::gc::GcError;
use crate::cache::locks::LockError;
use crate::config::ConfigError;
use crate::store::StoreError;

/// API error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("{0}")]
    Lock(#[from] LockError),

    #[error("{0}")]
    Gc(#[from] GcError),

    #[error("invalid settings: {0}")]
    Config(#[from] ConfigError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::Lock(e) => match e {
                LockError::SessionNotFound(_) => "session_not_found",
                LockError::NotSessionOwner(_) | LockError::NotLockOwner(_) => "forbidden",
                LockError::NotInDataset(_) => "not_in_dataset",
                LockError::UnknownObject(_) => "unknown_object",
                LockError::LockNotFound(_) => "lock_not_found",
                LockError::NotCached(_) => "not_cached",
                LockError::TransferFailed { .. } => "transfer_failed",
                LockError::Timeout(_) => "timeout",
                LockError::Store(_) => "store_error",
            },
            Self::Gc(_) => "gc_error",
            Self::Config(_) => "invalid_settings",
            Self::Store(_) => "store_error",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) | Self::Config(_) => StatusCode::BAD_REQUEST,
            Self::Lock(e) => match e {
                LockError::SessionNotFound(_)
                | LockError::UnknownObject(_)
                | LockError::LockNotFound(_) => StatusCode::NOT_FOUND,
                LockError::NotSessionOwner(_) | LockError::NotLockOwner(_) => StatusCode::FORBIDDEN,
                LockError::NotInDataset(_) => StatusCode::BAD_REQUEST,
                LockError::NotCached(_) => StatusCode::CONFLICT,
                LockError::TransferFailed { .. } => StatusCode::BAD_GATEWAY,
                LockError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                LockError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Gc(_) | Self::Store(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        let body = ErrorResponse {
            code: self.code().to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<InvalidObjectId> for ApiError {
    fn from(e: InvalidObjectId) -> Self {
        Self::BadRequest(e.to_string())
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
