use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    #[error("Forbidden: {message}")]
    Forbidden { message: String },

    #[error("Not found: {resource}")]
    NotFound { resource: String },

    #[error("Conflict: {message}")]
    Conflict { message: String },

    #[error("Store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Token error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("Password error: {0}")]
    Bcrypt(#[from] bcrypt::BcryptError),

    #[error("Internal server error: {0}")]
    Internal(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden {
            message: message.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Whether the batcher should retry this error instead of surfacing it.
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::Store(_))
    }
}

/// Error envelope sent on every failed HTTP request. The `path` field is
/// stamped by the response middleware, which sees the request URI.
#[derive(Serialize, Clone, Debug)]
pub struct ErrorEnvelope {
    pub error: String,
    pub detail: String,
    pub status_code: u16,
    pub timestamp: String,
    pub path: String,
}

impl ErrorEnvelope {
    pub fn new(error: &str, detail: String, status: StatusCode) -> Self {
        Self {
            error: error.to_string(),
            detail,
            status_code: status.as_u16(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            path: String::new(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, envelope) = match self {
            AppError::Validation { ref message } => (
                StatusCode::BAD_REQUEST,
                ErrorEnvelope::new("validation_error", message.clone(), StatusCode::BAD_REQUEST),
            ),
            AppError::Unauthorized { ref message } => (
                StatusCode::UNAUTHORIZED,
                ErrorEnvelope::new("unauthorized", message.clone(), StatusCode::UNAUTHORIZED),
            ),
            AppError::Forbidden { ref message } => (
                StatusCode::FORBIDDEN,
                ErrorEnvelope::new("forbidden", message.clone(), StatusCode::FORBIDDEN),
            ),
            AppError::NotFound { ref resource } => (
                StatusCode::NOT_FOUND,
                ErrorEnvelope::new(
                    "not_found",
                    format!("{} not found", resource),
                    StatusCode::NOT_FOUND,
                ),
            ),
            AppError::Conflict { ref message } => (
                StatusCode::CONFLICT,
                ErrorEnvelope::new("conflict", message.clone(), StatusCode::CONFLICT),
            ),
            AppError::Store(ref e) => {
                tracing::error!("Store error: {}", e);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    ErrorEnvelope::new(
                        "store_unavailable",
                        "Shared store unavailable".to_string(),
                        StatusCode::SERVICE_UNAVAILABLE,
                    ),
                )
            }
            AppError::Config(ref e) => {
                tracing::error!("Configuration error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorEnvelope::new(
                        "internal_error",
                        "Configuration error".to_string(),
                        StatusCode::INTERNAL_SERVER_ERROR,
                    ),
                )
            }
            AppError::Jwt(ref e) => {
                tracing::debug!("Token rejected: {}", e);
                (
                    StatusCode::UNAUTHORIZED,
                    ErrorEnvelope::new(
                        "unauthorized",
                        "Invalid token".to_string(),
                        StatusCode::UNAUTHORIZED,
                    ),
                )
            }
            AppError::Bcrypt(ref e) => {
                tracing::error!("Password processing error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorEnvelope::new(
                        "internal_error",
                        "Password processing error".to_string(),
                        StatusCode::INTERNAL_SERVER_ERROR,
                    ),
                )
            }
            AppError::Internal(ref message) => {
                tracing::error!("Internal error: {}", message);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorEnvelope::new(
                        "internal_error",
                        "Internal server error".to_string(),
                        StatusCode::INTERNAL_SERVER_ERROR,
                    ),
                )
            }
        };

        let mut response = (status, Json(envelope.clone())).into_response();
        // The logger middleware replaces the body with a path-stamped copy.
        response.extensions_mut().insert(envelope);
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (AppError::validation("bad"), StatusCode::BAD_REQUEST),
            (AppError::unauthorized("nope"), StatusCode::UNAUTHORIZED),
            (AppError::forbidden("denied"), StatusCode::FORBIDDEN),
            (AppError::not_found("Session"), StatusCode::NOT_FOUND),
            (AppError::conflict("dup"), StatusCode::CONFLICT),
            (
                AppError::internal("boom"),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, expected) in cases {
            let response = err.into_response();
            assert_eq!(response.status(), expected);
            assert!(response.extensions().get::<ErrorEnvelope>().is_some());
        }
    }

    #[test]
    fn test_transient_classification() {
        assert!(!AppError::validation("x").is_transient());
        assert!(!AppError::conflict("x").is_transient());
    }
}
