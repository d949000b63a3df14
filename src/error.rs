//! Error types for Lagoon
//!
//! All errors in the engine are converted to `AppError`,
//! which implements `IntoResponse` for proper HTTP error responses.
//! The status mapping tells remote peers whether a retry makes sense:
//! 4xx responses are final, 5xx responses may be retried by the peer.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Application-wide error type
#[derive(Debug, Error)]
pub enum AppError {
    /// Resource not found (404)
    #[error("Resource not found")]
    NotFound,

    /// Signer missing, unresolvable or signature invalid (401)
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Actor tried to act on an object it does not own (400)
    #[error("Not authorized: {0}")]
    Authorization(String),

    /// Inbound payload does not match the federation schema (400)
    #[error("Schema validation failed: {0}")]
    SchemaValidation(String),

    /// Fetched remote document does not match the federation schema (502)
    #[error("Remote document failed validation: {0}")]
    RemoteSchema(String),

    /// Network failure or non-2xx answer while fetching a dependency (502)
    #[error("Remote fetch failed: {0}")]
    RemoteFetch(String),

    /// Activity kind outside the supported set (400)
    #[error("Unsupported activity: {0}")]
    UnsupportedActivity(String),

    /// Local-looking URI whose id segment cannot be parsed (400)
    #[error("Malformed URI: {0}")]
    MalformedUri(String),

    /// Bridge allow-list configured but the caller address is unknown (500)
    #[error("Request source address is not available")]
    BridgeSourceUnavailable,

    /// Validation error (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Database error (500)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// HTTP client error (502)
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl AppError {
    /// HTTP status and short machine-readable label for this error
    pub fn status_and_type(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::NotFound => (StatusCode::NOT_FOUND, "not_found"),
            AppError::Authentication(_) => (StatusCode::UNAUTHORIZED, "authentication"),
            AppError::Authorization(_) => (StatusCode::BAD_REQUEST, "authorization"),
            AppError::SchemaValidation(_) => (StatusCode::BAD_REQUEST, "schema_validation"),
            AppError::RemoteSchema(_) => (StatusCode::BAD_GATEWAY, "remote_schema"),
            AppError::RemoteFetch(_) => (StatusCode::BAD_GATEWAY, "remote_fetch"),
            AppError::UnsupportedActivity(_) => {
                (StatusCode::BAD_REQUEST, "unsupported_activity")
            }
            AppError::MalformedUri(_) => (StatusCode::BAD_REQUEST, "malformed_uri"),
            AppError::BridgeSourceUnavailable => {
                (StatusCode::INTERNAL_SERVER_ERROR, "bridge_source_unavailable")
            }
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
            AppError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "database"),
            AppError::HttpClient(_) => (StatusCode::BAD_GATEWAY, "http_client"),
            AppError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "config"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        }
    }
}

impl IntoResponse for AppError {
    /// Convert error to HTTP response
    ///
    /// Internal details (database, internal) are not echoed to the peer.
    fn into_response(self) -> Response {
        use axum::Json;

        let (status, error_type) = self.status_and_type();
        let error_message = match &self {
            AppError::Database(_) => "Database error".to_string(),
            AppError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        };

        if status.is_server_error() {
            tracing::error!(error = %self, error_type, "Request failed");
        } else {
            tracing::debug!(error = %self, error_type, "Request rejected");
        }

        use crate::metrics::ERRORS_TOTAL;
        ERRORS_TOTAL.with_label_values(&[error_type]).inc();

        let body = Json(serde_json::json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
