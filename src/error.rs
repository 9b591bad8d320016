//! Application error types and result alias.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application result type alias
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error types.
///
/// The first group mirrors the job-level failure taxonomy surfaced to
/// operators; the rest wrap infrastructure failures.
#[derive(Error, Debug)]
pub enum AppError {
    /// Fleet or application config failed validation. Fatal at startup.
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The secret store could not produce credentials. Fails the job fast,
    /// never retried within a single job.
    #[error("Credentials unavailable: {0}")]
    CredentialsUnavailable(String),

    /// Transport-level failure talking to a Pulp server after the retry
    /// ceiling was exhausted.
    #[error("Pulp server unreachable: {0}")]
    PulpUnreachable(String),

    /// A Pulp task reached the failed state. Carries the server's error
    /// payload verbatim.
    #[error("Pulp task failed: {0}")]
    PulpTaskFailed(serde_json::Value),

    /// Another active job covers the same (server, repo, kind).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The job's wall-clock budget expired.
    #[error("Deadline exceeded: {0}")]
    Deadline(String),

    /// Operator-initiated cancellation.
    #[error("Canceled: {0}")]
    Canceled(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Map error variant to HTTP status code and machine-readable error code.
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            Self::ConfigInvalid(_) => (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_INVALID"),
            Self::CredentialsUnavailable(_) => {
                (StatusCode::BAD_GATEWAY, "CREDENTIALS_UNAVAILABLE")
            }
            Self::PulpUnreachable(_) => (StatusCode::BAD_GATEWAY, "PULP_UNREACHABLE"),
            Self::PulpTaskFailed(_) => (StatusCode::BAD_GATEWAY, "PULP_TASK_FAILED"),
            Self::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            Self::Deadline(_) => (StatusCode::GATEWAY_TIMEOUT, "DEADLINE"),
            Self::Canceled(_) => (StatusCode::CONFLICT, "CANCELED"),
            Self::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            Self::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            Self::Database(_) | Self::Sqlx(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR")
            }
            Self::Migration(_) => (StatusCode::INTERNAL_SERVER_ERROR, "MIGRATION_ERROR"),
            Self::Git(_) => (StatusCode::INTERNAL_SERVER_ERROR, "GIT_ERROR"),
            Self::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR"),
            Self::AddrParse(_) => (StatusCode::INTERNAL_SERVER_ERROR, "ADDR_PARSE_ERROR"),
            Self::Json(_) => (StatusCode::BAD_REQUEST, "JSON_ERROR"),
            Self::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }

    /// Return a user-facing message. Internal details are hidden for
    /// wrapped foreign errors (Sqlx, Io, etc.) to avoid leaking internals.
    fn user_message(&self) -> String {
        match self {
            Self::Sqlx(_) => "Database operation failed".to_string(),
            Self::Migration(_) => "Database migration failed".to_string(),
            Self::Io(_) => "IO operation failed".to_string(),
            Self::AddrParse(_) => "Invalid address".to_string(),
            Self::Json(_) => "Invalid JSON".to_string(),
            other => other.to_string(),
        }
    }

    /// Serialize the error into the JSON payload stored on a failed job or
    /// repo task result.
    pub fn to_job_error(&self) -> serde_json::Value {
        let (_, code) = self.status_and_code();
        match self {
            // Pulp task payloads are recorded verbatim.
            Self::PulpTaskFailed(payload) => json!({
                "code": code,
                "detail": payload,
            }),
            other => json!({
                "code": code,
                "msg": other.to_string(),
            }),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let message = self.user_message();

        tracing::error!(error = %self, code = code, "Request error");

        let body = Json(json!({
            "code": code,
            "message": message,
        }));

        (status, body).into_response()
    }
}
