//! Error types for CreatorSync
//!
//! All errors in the application are converted to `AppError`,
//! which implements `IntoResponse` for proper HTTP error responses.

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Application-wide error type
///
/// Each variant maps to one machine-readable `kind` so clients can
/// distinguish, for example, "reconnect required" from a generic failure.
#[derive(Debug, Error)]
pub enum AppError {
    /// Resource not found (404)
    #[error("Resource not found")]
    NotFound,

    /// Authentication required (401)
    #[error("Authentication required")]
    Unauthorized,

    /// Access denied (403)
    #[error("Access denied")]
    Forbidden,

    /// Validation error (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// A sync is already running for this account (409)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Upstream identity already belongs to another owner (409)
    #[error("Instagram account is already connected to a different owner")]
    OwnershipConflict,

    /// Stored token is expired, revoked or otherwise unusable (401)
    #[error("Instagram connection expired, reconnect required")]
    ReconnectRequired,

    /// Upstream rejected the call for a missing permission or scope (403)
    #[error("Missing Instagram permission: {0}")]
    PermissionDenied(String),

    /// Upstream kept failing transiently or rate limiting (503)
    #[error("Instagram is temporarily unavailable, retry in {retry_after_secs}s")]
    ServiceUnavailable { retry_after_secs: u64 },

    /// Upstream returned an error that is not retryable (502)
    #[error("Instagram API error: {0}")]
    Upstream(String),

    /// Upstream could not be reached at all (502)
    #[error("Could not reach Instagram: {0}")]
    Connectivity(String),

    /// Database error (500)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Webhook signature verification failed (401)
    #[error("Invalid signature")]
    InvalidSignature,

    /// OAuth `state` missing, mismatched or stale (400)
    #[error("Invalid OAuth state: {0}")]
    InvalidOAuthState(String),

    /// Local quota exhausted (429)
    #[error("Rate limit exceeded")]
    RateLimited,

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
    /// Machine-readable error kind used in JSON bodies, metrics and redirects.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::NotFound => "not_found",
            AppError::Unauthorized => "unauthorized",
            AppError::Forbidden => "forbidden",
            AppError::Validation(_) => "validation",
            AppError::Conflict(_) => "conflict",
            AppError::OwnershipConflict => "ownership_conflict",
            AppError::ReconnectRequired => "reconnect_required",
            AppError::PermissionDenied(_) => "permission_denied",
            AppError::ServiceUnavailable { .. } => "service_unavailable",
            AppError::Upstream(_) => "upstream",
            AppError::Connectivity(_) => "connectivity",
            AppError::Database(_) => "database",
            AppError::InvalidSignature => "invalid_signature",
            AppError::InvalidOAuthState(_) => "invalid_oauth_state",
            AppError::RateLimited => "rate_limited",
            AppError::Config(_) => "config",
            AppError::Internal(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Unauthorized
            | AppError::ReconnectRequired
            | AppError::InvalidSignature => StatusCode::UNAUTHORIZED,
            AppError::Forbidden | AppError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            AppError::Validation(_) | AppError::InvalidOAuthState(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) | AppError::OwnershipConflict => StatusCode::CONFLICT,
            AppError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Upstream(_) | AppError::Connectivity(_) => StatusCode::BAD_GATEWAY,
            AppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AppError::Database(_) | AppError::Config(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    /// Convert error to HTTP response
    ///
    /// Maps each error variant to appropriate HTTP status code
    /// and JSON error body. Internal details are not leaked.
    fn into_response(self) -> Response {
        use axum::Json;

        let status = self.status();
        let kind = self.kind();
        let error_message = match &self {
            AppError::Database(_) => "Database error".to_string(),
            AppError::Internal(_) => "Internal server error".to_string(),
            _ => self.to_string(),
        };

        if status.is_server_error() {
            tracing::error!(error = %self, kind, "Request failed");
        }

        use crate::metrics::ERRORS_TOTAL;
        ERRORS_TOTAL.with_label_values(&[kind]).inc();

        let mut body = serde_json::json!({
            "error": error_message,
            "kind": kind,
        });

        let retry_after = match &self {
            AppError::ServiceUnavailable { retry_after_secs } => {
                body["retry_after_secs"] = serde_json::json!(retry_after_secs);
                HeaderValue::from_str(&retry_after_secs.to_string()).ok()
            }
            _ => None,
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(value) = retry_after {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        response.headers_mut().insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        );
        response
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
