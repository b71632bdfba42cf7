//! Error types for the Marketsync engine and service

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Engine-wide result type
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors raised by the synchronization engine.
///
/// Transport and persistence failures are retried inside their own layers;
/// anything that escapes those layers aborts only the owning sync unit.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Provider rejected the credentials (401/403). Never retried.
    #[error("Authentication rejected by provider (status {status}): {message}")]
    Auth { status: u16, message: String },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Pagination error: {0}")]
    Pagination(#[from] PaginationError),

    /// Provider declared the report job as failed
    #[error("Job {job_id} failed: {reason}")]
    JobFailed { job_id: String, reason: String },

    #[error("Job {job_id} was canceled by the provider")]
    JobCanceled { job_id: String },

    /// The job did not reach a terminal state within `max_polls`
    #[error("Job {job_id} did not finish after {polls} polls")]
    JobTimeout { job_id: String, polls: u32 },

    /// The finished job's artifact could not be downloaded
    #[error("Artifact for job {job_id} unusable: {reason}")]
    JobArtifact { job_id: String, reason: String },

    #[error("Reconciliation error: {0}")]
    Reconcile(String),

    /// Store error that may heal on its own (connection loss, busy database)
    #[error("Transient store error: {0}")]
    PersistenceTransient(String),

    /// Store error that will not heal (constraint violation, bad statement)
    #[error("Store error: {0}")]
    PersistenceFatal(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Infrastructure-class failures justify re-running a whole sync unit.
    /// Data-class failures (auth, provider-declared job failures) do not.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, SyncError::PersistenceTransient(_))
    }

    /// Short machine-readable label used in the run ledger
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Auth { .. } => "auth",
            SyncError::Transport(_) => "transport",
            SyncError::Pagination(_) => "pagination",
            SyncError::JobFailed { .. } => "job_failed",
            SyncError::JobCanceled { .. } => "job_canceled",
            SyncError::JobTimeout { .. } => "job_timeout",
            SyncError::JobArtifact { .. } => "job_artifact",
            SyncError::Reconcile(_) => "reconcile",
            SyncError::PersistenceTransient(_) => "persistence_transient",
            SyncError::PersistenceFatal(_) => "persistence_fatal",
            SyncError::Config(_) => "config",
        }
    }
}

/// Transport-level failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Every attempt allowed by the retry policy failed
    #[error("gave up after {attempts} attempts, last failure: {last}")]
    AttemptsExhausted { attempts: u32, last: String },

    /// A successful response whose body is not valid JSON
    #[error("malformed response body: {0}")]
    MalformedBody(String),

    /// Non-retryable HTTP status
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    /// Non-retryable connection failure, or a failure on a request that may not be retried
    #[error("request failed: {0}")]
    Connection(String),
}

/// Pagination contract violations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PaginationError {
    #[error("page cap of {cap} pages exceeded")]
    CapExceeded { cap: u32 },

    #[error("unexpected page shape: {0}")]
    UnexpectedShape(String),

    #[error("empty page after {fetched} of {total} reported records")]
    ShortTotal { fetched: u64, total: u64 },
}

/// Service-level result type
pub type AppResult<T> = std::result::Result<T, AppError>;

/// Service error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Error response body
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An internal error occurred".to_string(),
                )
            }
            AppError::Sync(e) => {
                tracing::error!("Sync error: {}", e);
                match e {
                    SyncError::Config(msg) => (StatusCode::BAD_REQUEST, "config_error", msg.clone()),
                    SyncError::Auth { .. } => (
                        StatusCode::BAD_GATEWAY,
                        "provider_auth",
                        "Provider rejected credentials".to_string(),
                    ),
                    _ => (StatusCode::BAD_GATEWAY, e.kind(), "Sync failed".to_string()),
                }
            }
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "database_error",
                    "Database error".to_string(),
                )
            }
            AppError::Io(e) => {
                tracing::error!("IO error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "io_error",
                    "IO error".to_string(),
                )
            }
            AppError::Json(e) => {
                tracing::error!("JSON error: {}", e);
                (
                    StatusCode::BAD_REQUEST,
                    "json_error",
                    "Invalid JSON".to_string(),
                )
            }
        };

        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message,
            details: if cfg!(debug_assertions) {
                Some(self.to_string())
            } else {
                None
            },
        });

        (status, body).into_response()
    }
}
