//! Error taxonomy shared by every layer of the storage engine.
//!
//! Every failure is one of a closed set of kinds. The kind travels unchanged
//! from the repositories through the pipelines to the HTTP boundary, where it
//! is mapped to a status code.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use rusqlite::ErrorCode;
use serde::Serialize;
use thiserror::Error;

/// Closed set of error kinds, serialized as the `error` field of HTTP bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    QuotaExceeded,
    Conflict,
    NotFound,
    Forbidden,
    InvalidOrPrivate,
    RateLimited,
    Timeout,
    StorageIo,
    Persistence,
    InvariantViolation,
}

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("storage quota exceeded for user {user_id}: requested {requested} bytes, {available} available")]
    QuotaExceeded {
        user_id: i64,
        requested: u64,
        available: u64,
    },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("link invalid or file private")]
    InvalidOrPrivate,

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("operation deadline expired")]
    Timeout,

    #[error("storage I/O error: {0}")]
    StorageIo(#[from] std::io::Error),

    #[error("persistence error: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

pub type VaultResult<T> = Result<T, VaultError>;

impl VaultError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VaultError::Validation(_) => ErrorKind::Validation,
            VaultError::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            VaultError::Conflict(_) => ErrorKind::Conflict,
            VaultError::NotFound(_) => ErrorKind::NotFound,
            VaultError::Forbidden(_) => ErrorKind::Forbidden,
            VaultError::InvalidOrPrivate => ErrorKind::InvalidOrPrivate,
            VaultError::RateLimited => ErrorKind::RateLimited,
            VaultError::Timeout => ErrorKind::Timeout,
            VaultError::StorageIo(_) => ErrorKind::StorageIo,
            VaultError::Persistence(_) => ErrorKind::Persistence,
            VaultError::InvariantViolation(_) => ErrorKind::InvariantViolation,
        }
    }

    /// True when the error came from a UNIQUE or PRIMARY KEY constraint.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            VaultError::Persistence(e) => is_unique_violation(e),
            _ => false,
        }
    }
}

/// Distinguishes uniqueness failures from other constraint failures
/// (foreign keys, CHECKs), which share the primary `ConstraintViolation` code.
pub fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => {
            e.code == ErrorCode::ConstraintViolation
                && (e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
        }
        _ => false,
    }
}

pub fn is_foreign_key_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => {
            e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY
        }
        _ => false,
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: ErrorKind,
    message: &'a str,
}

impl ResponseError for VaultError {
    fn status_code(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::QuotaExceeded => StatusCode::PAYLOAD_TOO_LARGE,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::InvalidOrPrivate => StatusCode::NOT_FOUND,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::StorageIo | ErrorKind::Persistence | ErrorKind::InvariantViolation => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        // Internal failures are not echoed to clients verbatim.
        let message = match self.kind() {
            ErrorKind::StorageIo | ErrorKind::Persistence | ErrorKind::InvariantViolation => {
                "internal storage error".to_string()
            }
            _ => self.to_string(),
        };
        HttpResponse::build(self.status_code()).json(ErrorBody {
            error: self.kind(),
            message: &message,
        })
    }
}
