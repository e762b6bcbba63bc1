use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Uniform error body returned by every route.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Not Found", "Conflict")
    pub error: String,
    /// Machine-readable error code
    pub code: String,
    /// Human-readable error description
    pub message: String,
    /// Whether the client may retry the same request
    pub retryable: bool,
    /// ISO 8601 timestamp when the error occurred
    pub timestamp: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] DbErr),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Payment not found: {0}")]
    PaymentNotFound(Uuid),

    #[error("Checkout session not found")]
    SessionNotFound,

    #[error("Checkout session is outdated; a newer session exists for this payment")]
    SessionOutdated,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Payment already exists for attendance {0}")]
    PaymentAlreadyExists(Uuid),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Payment processor error: {message}")]
    ProcessorApiError { message: String, retryable: bool },

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

pub trait IntoDbErr {
    fn into_db_err(self) -> DbErr;
}

impl IntoDbErr for DbErr {
    fn into_db_err(self) -> DbErr {
        self
    }
}

impl IntoDbErr for String {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self)
    }
}

impl IntoDbErr for &str {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self.to_string())
    }
}

impl ServiceError {
    /// Generic constructor that normalizes any supported database error input.
    pub fn db_error<E: IntoDbErr>(error: E) -> Self {
        ServiceError::DatabaseError(error.into_db_err())
    }

    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        ServiceError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::DatabaseError(_) | Self::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ValidationError(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) | Self::PaymentNotFound(_) | Self::SessionNotFound => {
                StatusCode::NOT_FOUND
            }
            Self::Conflict(_) | Self::PaymentAlreadyExists(_) | Self::SessionOutdated => {
                StatusCode::CONFLICT
            }
            Self::InvalidOperation(_) | Self::InvalidTransition { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Self::ProcessorApiError { .. } => StatusCode::BAD_GATEWAY,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Machine-readable code rendered in the error body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DatabaseError(_) => "database_error",
            Self::ValidationError(_) => "validation_error",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::PaymentNotFound(_) => "payment_not_found",
            Self::SessionNotFound => "session_not_found",
            Self::SessionOutdated => "session_outdated",
            Self::Conflict(_) => "conflict",
            Self::PaymentAlreadyExists(_) => "payment_already_exists",
            Self::InvalidOperation(_) => "invalid_operation",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::ProcessorApiError { .. } => "processor_api_error",
            Self::ServiceUnavailable(_) => "service_unavailable",
            Self::InternalError(_) => "internal_error",
        }
    }

    /// Whether the caller may offer a retry for the same request.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::DatabaseError(_) | Self::ServiceUnavailable(_) => true,
            Self::ProcessorApiError { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::InternalError(_) => "Internal server error".to_string(),
            Self::ProcessorApiError { retryable, .. } => {
                if *retryable {
                    "Payment processor temporarily unavailable".to_string()
                } else {
                    "Payment processor rejected the request".to_string()
                }
            }
            _ => self.to_string(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match &self {
            Self::DatabaseError(e) => tracing::error!(error = %e, "request failed with database error"),
            Self::InternalError(e) => tracing::error!(error = %e, "request failed with internal error"),
            Self::ProcessorApiError { message, retryable } => {
                tracing::warn!(%message, retryable, "request failed with processor error")
            }
            _ => {}
        }

        let err = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            code: self.code().to_string(),
            message: self.response_message(),
            retryable: self.is_retryable(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(err)).into_response()
    }
}
