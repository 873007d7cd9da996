//! Error types for fedcourier
//!
//! All errors in the application are converted to `AppError`,
//! which implements `IntoResponse` for the admin API.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Application-wide error type
///
/// Dispatch-time failures (network, remote rejection, bad keys) are not
/// surfaced through this type to the coordinator; they are folded into an
/// `AttemptOutcome`. What remains here is store, configuration and API
/// failures.
#[derive(Debug, Error)]
pub enum AppError {
    /// Resource not found (404)
    #[error("Resource not found")]
    NotFound,

    /// Record is not in the state the write expected (409)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Authentication required (401)
    #[error("Authentication required")]
    Unauthorized,

    /// Validation error (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Database error (500)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failure (500)
    #[error("Migration failed: {0}")]
    Migration(String),

    /// HTTP client error (502)
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Signing key could not be parsed
    #[error("Invalid signing key: {0}")]
    InvalidKey(String),

    /// Cryptographic backend failed while signing
    #[error("Signing failure: {0}")]
    Signing(String),

    /// Store writes kept failing past the retry budget (503)
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Whether a failed store write may succeed if issued again.
    pub fn is_transient_store_error(&self) -> bool {
        match self {
            AppError::Database(error) => !matches!(error, sqlx::Error::RowNotFound),
            AppError::StoreUnavailable(_) => true,
            _ => false,
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        use axum::Json;

        let (status, error_message, error_type) = match &self {
            AppError::NotFound => (StatusCode::NOT_FOUND, self.to_string(), "not_found"),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone(), "conflict"),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string(), "unauthorized"),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone(), "validation"),
            AppError::InvalidKey(msg) => (StatusCode::BAD_REQUEST, msg.clone(), "invalid_key"),
            AppError::HttpClient(_) => (StatusCode::BAD_GATEWAY, self.to_string(), "http_client"),
            AppError::StoreUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, msg.clone(), "store_unavailable")
            }
            AppError::Database(_) | AppError::Migration(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Database error".to_string(),
                "database",
            ),
            AppError::Signing(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone(), "signing"),
            AppError::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone(), "config"),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
                "internal",
            ),
        };

        crate::metrics::ERRORS_TOTAL
            .with_label_values(&[error_type])
            .inc();

        let body = Json(serde_json::json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
