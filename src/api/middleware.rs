use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application error types
#[derive(Debug, Error)]
pub enum AppError {
    /// Malformed or duplicate configuration; fatal at load time.
    #[error("Configuration error: {0}")]
    ConfigLoad(String),

    #[error("Validation error: {0}")]
    Validation(String),

    /// A client-supplied value does not match the declared parameter type.
    #[error("Invalid value for parameter '{parameter}': expected {expected}, {reason}")]
    ParameterCoercion {
        parameter: String,
        expected: String,
        reason: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database '{database}' is unavailable: {reason}")]
    DatabaseUnavailable { database: String, reason: String },

    /// The pool had no free connection within the acquire timeout.
    #[error("Timed out after {waited_ms} ms waiting for a connection to database '{database}'")]
    ConnectionTimeout { database: String, waited_ms: u64 },

    #[error("Execution of query '{query}' failed: {message}")]
    SqlExecution { query: String, message: String },

    #[error("Internal server error: {0}")]
    Internal(String),
}

/// HTTP-facing classification of an [`AppError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    BadRequest,
    NotFound,
    ServiceUnavailable,
    Internal,
}

impl AppError {
    pub fn classification(&self) -> ErrorClass {
        match self {
            AppError::Validation(_) | AppError::ParameterCoercion { .. } => ErrorClass::BadRequest,
            AppError::NotFound(_) => ErrorClass::NotFound,
            AppError::DatabaseUnavailable { .. } | AppError::ConnectionTimeout { .. } => {
                ErrorClass::ServiceUnavailable
            }
            AppError::ConfigLoad(_) | AppError::SqlExecution { .. } | AppError::Internal(_) => {
                ErrorClass::Internal
            }
        }
    }

    /// Whether a caller may reasonably retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::ConnectionTimeout { .. })
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::ConfigLoad(_) => "CONFIG_ERROR",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::ParameterCoercion { .. } => "INVALID_PARAMETER",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::DatabaseUnavailable { .. } => "DATABASE_UNAVAILABLE",
            AppError::ConnectionTimeout { .. } => "CONNECTION_TIMEOUT",
            AppError::SqlExecution { .. } => "SQL_EXECUTION_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self.classification() {
            ErrorClass::BadRequest => StatusCode::BAD_REQUEST,
            ErrorClass::NotFound => StatusCode::NOT_FOUND,
            ErrorClass::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorClass::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error response format
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorDetail {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut detail = ErrorDetail::new(self.code(), self.to_string());

        match &self {
            AppError::ConnectionTimeout { .. } => {
                detail = detail.with_details("The connection pool is exhausted. The request may be retried.");
            }
            AppError::DatabaseUnavailable { .. } => {
                detail = detail.with_details("Endpoints bound to other databases are not affected.");
            }
            AppError::SqlExecution { .. } | AppError::Internal(_) | AppError::ConfigLoad(_) => {
                tracing::error!("{}", self);
            }
            _ => {}
        }

        let body = Json(ErrorResponse { error: detail });

        (status, body).into_response()
    }
}

/// Convert anyhow::Error to AppError
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(err: serde_yaml::Error) -> Self {
        AppError::ConfigLoad(err.to_string())
    }
}
