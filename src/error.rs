//! Error types for the render queue service and the render pipeline

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Service-level error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("{0}")]
    Admission(String),

    #[error("Render job not found: {0}")]
    JobNotFound(String),

    #[error("Render job already queued: {0}")]
    DuplicateJob(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Render queue is closed")]
    QueueClosed,

    #[error("Lease for job {0} is no longer held by this worker")]
    LeaseLost(String),

    #[error("Too many subscribers for job {0}")]
    SubscriberLimit(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error response format (OpenAI compatible)
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub message: String,
    pub r#type: String,
    pub code: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, code) = match &self {
            AppError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "server_error", None),
            AppError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "server_error", None),
            AppError::Json(_) => (StatusCode::BAD_REQUEST, "invalid_request_error", Some("invalid_json")),
            AppError::HttpClient(_) => (StatusCode::BAD_GATEWAY, "upstream_error", None),
            AppError::Admission(_) => (StatusCode::TOO_MANY_REQUESTS, "rate_limit_error", Some("render_quota_exceeded")),
            AppError::JobNotFound(_) => (StatusCode::NOT_FOUND, "not_found_error", Some("render_not_found")),
            AppError::DuplicateJob(_) => (StatusCode::CONFLICT, "invalid_request_error", Some("render_already_queued")),
            AppError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request_error", None),
            AppError::QueueClosed => (StatusCode::SERVICE_UNAVAILABLE, "server_error", Some("queue_closed")),
            AppError::LeaseLost(_) => (StatusCode::CONFLICT, "server_error", Some("lease_lost")),
            AppError::SubscriberLimit(_) => (StatusCode::TOO_MANY_REQUESTS, "rate_limit_error", Some("too_many_subscribers")),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "server_error", None),
        };

        let body = Json(ErrorResponse {
            error: ErrorDetail {
                message: self.to_string(),
                r#type: error_type.to_string(),
                code: code.map(|c| c.to_string()),
            },
        });

        (status, body).into_response()
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, AppError>;

/// Stable tag for each pipeline failure class.
///
/// Decides whether a refund is owed and whether the queue may retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InsufficientCredits,
    Generation,
    Quality,
    Duplicate,
    Storage,
    Persistence,
    Ledger,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InsufficientCredits => "insufficient_credits",
            ErrorKind::Generation => "generation",
            ErrorKind::Quality => "quality",
            ErrorKind::Duplicate => "duplicate",
            ErrorKind::Storage => "storage",
            ErrorKind::Persistence => "persistence",
            ErrorKind::Ledger => "ledger",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

/// Errors raised inside the render pipeline
#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    #[error("Insufficient credits")]
    InsufficientCredits,

    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("Quality check failed: {}", .issues.join("; "))]
    Quality { issues: Vec<String> },

    #[error("Duplicate of render {matched_render_id} ({similarity:.1}% similar)")]
    Duplicate {
        matched_render_id: String,
        similarity: f64,
    },

    #[error("Storage failed: {0}")]
    Storage(String),

    #[error("Persistence failed: {0}")]
    Persistence(String),

    #[error("Credit ledger error: {0}")]
    Ledger(String),

    #[error("Render cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::InsufficientCredits => ErrorKind::InsufficientCredits,
            PipelineError::Generation(_) => ErrorKind::Generation,
            PipelineError::Quality { .. } => ErrorKind::Quality,
            PipelineError::Duplicate { .. } => ErrorKind::Duplicate,
            PipelineError::Storage(_) => ErrorKind::Storage,
            PipelineError::Persistence(_) => ErrorKind::Persistence,
            PipelineError::Ledger(_) => ErrorKind::Ledger,
            PipelineError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether the queue may redeliver the job after this failure
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            PipelineError::InsufficientCredits
                | PipelineError::Duplicate { .. }
                | PipelineError::Cancelled
        )
    }

    /// Whether a prior credit charge must be returned once this failure is final
    pub fn requires_refund(&self) -> bool {
        self.kind() != ErrorKind::InsufficientCredits
    }
}
