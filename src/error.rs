//! Error taxonomy for the relay.
//!
//! Every error on the HTTP path serializes as
//! `{"error": {"code", "message", "details?"}}`. Errors inside background
//! timers and event handlers are logged and isolated — they never
//! terminate the process.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Stable machine-readable error codes surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    BadRequest,
    NotFound,
    Conflict,
    RateLimited,
    PayloadTooLarge,
    UploadFailed,
    ChecksumMismatch,
    ServiceUnavailable,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ErrorCode::UploadFailed => "UPLOAD_FAILED",
            ErrorCode::ChecksumMismatch => "CHECKSUM_MISMATCH",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::Conflict => StatusCode::CONFLICT,
            ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ErrorCode::UploadFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::ChecksumMismatch => StatusCode::BAD_REQUEST,
            ErrorCode::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Errors produced by the relay's session, share, and transfer paths.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("missing or invalid field: {0}")]
    BadRequest(String),

    #[error("share session '{0}' not found")]
    ShareNotFound(String),

    #[error("upload '{0}' not found")]
    UploadNotFound(String),

    #[error("share session '{0}' already exists")]
    DuplicateShare(String),

    #[error("share session '{0}' is full")]
    ShareFull(String),

    #[error("client '{0}' already belongs to a share session")]
    AlreadyInShare(String),

    #[error("rate limit exceeded, resets at {reset_at}")]
    RateLimited { reset_at: i64 },

    #[error("file size {size} exceeds the {max} byte limit")]
    FileTooLarge { size: u64, max: u64 },

    #[error("upload rejected: {0}")]
    UploadFailed(String),

    #[error("chunk {chunk_index} checksum mismatch")]
    ChecksumMismatch { chunk_index: u32 },

    #[error("coordination store unavailable: {0}")]
    StoreUnavailable(String),
}

impl RelayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RelayError::BadRequest(_) => ErrorCode::BadRequest,
            RelayError::ShareNotFound(_) | RelayError::UploadNotFound(_) => ErrorCode::NotFound,
            RelayError::DuplicateShare(_)
            | RelayError::ShareFull(_)
            | RelayError::AlreadyInShare(_) => ErrorCode::Conflict,
            RelayError::RateLimited { .. } => ErrorCode::RateLimited,
            RelayError::FileTooLarge { .. } => ErrorCode::PayloadTooLarge,
            RelayError::UploadFailed(_) => ErrorCode::UploadFailed,
            RelayError::ChecksumMismatch { .. } => ErrorCode::ChecksumMismatch,
            RelayError::StoreUnavailable(_) => ErrorCode::ServiceUnavailable,
        }
    }

    /// The code string clients branch on. `ShareFull` keeps the wire name
    /// the browser client already matches against.
    pub fn wire_code(&self) -> &'static str {
        match self {
            RelayError::ShareFull(_) => "SHARE_SESSION_FULL",
            RelayError::FileTooLarge { .. } => "FILE_TOO_LARGE",
            other => other.code().as_str(),
        }
    }

    fn details(&self) -> Option<serde_json::Value> {
        match self {
            RelayError::RateLimited { reset_at } => Some(json!({ "resetAt": reset_at })),
            RelayError::FileTooLarge { size, max } => {
                Some(json!({ "fileSize": size, "maxFileSize": max }))
            }
            RelayError::ChecksumMismatch { chunk_index } => {
                Some(json!({ "chunkIndex": chunk_index }))
            }
            _ => None,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let mut error = json!({
            "code": self.wire_code(),
            "message": self.to_string(),
        });
        if let Some(details) = self.details() {
            error["details"] = details;
        }
        (self.code().status(), Json(json!({ "error": error }))).into_response()
    }
}

/// Errors from the storage backends. Callers on the hot path log these
/// rather than propagate — a lost write is absorbed by the ACK/retry
/// machinery.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<StorageError> for RelayError {
    fn from(err: StorageError) -> Self {
        RelayError::StoreUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_map_to_expected_statuses() {
        assert_eq!(ErrorCode::BadRequest.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorCode::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorCode::Conflict.status(), StatusCode::CONFLICT);
        assert_eq!(ErrorCode::RateLimited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            ErrorCode::PayloadTooLarge.status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ErrorCode::ServiceUnavailable.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_share_full_uses_wire_code() {
        let err = RelayError::ShareFull("share-1".to_string());
        assert_eq!(err.wire_code(), "SHARE_SESSION_FULL");
        assert_eq!(err.code(), ErrorCode::Conflict);
    }

    #[test]
    fn test_file_too_large_wire_code() {
        let err = RelayError::FileTooLarge { size: 2, max: 1 };
        assert_eq!(err.wire_code(), "FILE_TOO_LARGE");
        assert_eq!(err.code().status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn test_rate_limited_carries_reset_details() {
        let err = RelayError::RateLimited { reset_at: 1234 };
        let details = err.details().unwrap();
        assert_eq!(details["resetAt"], 1234);
    }
}
