//! Error handling for the Lockstep API
//!
//! One error type for the whole service, built with thiserror and mapped to
//! HTTP status codes via Axum's IntoResponse trait.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::models::{CommandParseError, DeviceValidationError};

/// API error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error code for client-side handling
    pub code: &'static str,
    /// Human-readable error message
    pub message: String,
    /// Optional additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Main API error type
#[derive(Error, Debug)]
pub enum ApiError {
    // ========== Authentication & Authorization ==========
    /// Invalid or missing authentication credentials
    #[error("authentication required")]
    Unauthorized,

    /// Invalid token (expired, malformed, etc.)
    #[error("invalid authentication token: {0}")]
    InvalidToken(String),

    /// Caller lacks permission for the requested operation
    #[error("insufficient permissions: {0}")]
    Forbidden(String),

    // ========== Resource Errors ==========
    /// Unknown device, pair, session, participant or code
    #[error("{resource_type} not found: {id}")]
    NotFound {
        resource_type: &'static str,
        id: String,
    },

    // ========== Pairing Errors ==========
    /// Pairing code or bundle is past its expiry
    #[error("{resource_type} expired: {code}")]
    Expired {
        resource_type: &'static str,
        code: String,
    },

    /// Code or bundle already consumed
    #[error("{resource_type} already claimed: {code}")]
    AlreadyClaimed {
        resource_type: &'static str,
        code: String,
    },

    /// Bundle slot already held by a different device
    #[error("{slot} slot of bundle {code} is already bound to {bound_device_id}")]
    AlreadyBound {
        code: String,
        slot: String,
        bound_device_id: String,
    },

    // ========== Session Errors ==========
    /// Command illegal for the current status; carries the authoritative state
    #[error("cannot apply '{command}' to {target} in status '{status}'")]
    InvalidTransition {
        target: &'static str,
        command: String,
        status: String,
        current: Box<serde_json::Value>,
    },

    // ========== Validation Errors ==========
    /// Request validation failed
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Invalid request body format
    #[error("invalid request body: {0}")]
    InvalidBody(String),

    // ========== Persistence Errors ==========
    /// Database query failed
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Store rejected or lost a write
    #[error("store error: {0}")]
    Store(String),

    // ========== Broker Errors ==========
    /// Redis operation failed
    #[error("broker error: {0}")]
    Redis(#[from] redis::RedisError),

    // ========== Configuration Errors ==========
    #[error("configuration error: {0}")]
    Configuration(String),

    // ========== Internal Errors ==========
    /// Internal server error (catch-all for unexpected errors)
    #[error("internal server error: {0}")]
    Internal(String),

    /// JSON serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// WebSocket error
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// JWT encoding/decoding error
    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

impl ApiError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 401 Unauthorized
            Self::Unauthorized | Self::InvalidToken(_) => StatusCode::UNAUTHORIZED,

            // 403 Forbidden
            Self::Forbidden(_) => StatusCode::FORBIDDEN,

            // 404 Not Found
            Self::NotFound { .. } => StatusCode::NOT_FOUND,

            // 409 Conflict
            Self::AlreadyClaimed { .. }
            | Self::AlreadyBound { .. }
            | Self::InvalidTransition { .. } => StatusCode::CONFLICT,

            // 410 Gone
            Self::Expired { .. } => StatusCode::GONE,

            // 400 Bad Request
            Self::ValidationError(_) | Self::InvalidBody(_) => StatusCode::BAD_REQUEST,

            // 422 Unprocessable Entity
            Self::Serialization(_) => StatusCode::UNPROCESSABLE_ENTITY,

            // 503 Service Unavailable
            Self::Redis(_) => StatusCode::SERVICE_UNAVAILABLE,

            // 500 Internal Server Error
            Self::Database(_)
            | Self::Store(_)
            | Self::Configuration(_)
            | Self::Internal(_)
            | Self::WebSocket(_)
            | Self::Jwt(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code string for client-side handling
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "UNAUTHORIZED",
            Self::InvalidToken(_) => "INVALID_TOKEN",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Expired { .. } => "EXPIRED",
            Self::AlreadyClaimed { .. } => "ALREADY_CLAIMED",
            Self::AlreadyBound { .. } => "ALREADY_BOUND",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::ValidationError(_) => "VALIDATION_ERROR",
            Self::InvalidBody(_) => "INVALID_BODY",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Store(_) => "STORE_ERROR",
            Self::Redis(_) => "BROKER_ERROR",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::WebSocket(_) => "WEBSOCKET_ERROR",
            Self::Jwt(_) => "JWT_ERROR",
        }
    }

    /// Create a not found error for a specific resource
    pub fn not_found(resource_type: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource_type,
            id: id.into(),
        }
    }

    pub fn expired(resource_type: &'static str, code: impl Into<String>) -> Self {
        Self::Expired {
            resource_type,
            code: code.into(),
        }
    }

    pub fn already_claimed(resource_type: &'static str, code: impl Into<String>) -> Self {
        Self::AlreadyClaimed {
            resource_type,
            code: code.into(),
        }
    }

    /// Build an `InvalidTransition` that embeds the current state of `current`
    pub fn invalid_transition<T: Serialize>(
        target: &'static str,
        command: impl std::fmt::Display,
        status: impl std::fmt::Display,
        current: &T,
    ) -> Self {
        Self::InvalidTransition {
            target,
            command: command.to_string(),
            status: status.to_string(),
            current: Box::new(serde_json::to_value(current).unwrap_or(serde_json::Value::Null)),
        }
    }

    /// Extra payload attached to the response body
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::InvalidTransition { current, .. } => Some(current.as_ref().clone()),
            Self::AlreadyBound {
                slot,
                bound_device_id,
                ..
            } => Some(serde_json::json!({
                "slot": slot,
                "boundDeviceId": bound_device_id,
            })),
            _ => None,
        }
    }

    /// Log the error with appropriate severity based on status code
    pub fn log(&self) {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(
                error = %self,
                code = self.error_code(),
                status = status.as_u16(),
                "Server error occurred"
            );
        } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            tracing::warn!(
                error = %self,
                code = self.error_code(),
                status = status.as_u16(),
                "Authorization error"
            );
        } else {
            tracing::debug!(
                error = %self,
                code = self.error_code(),
                status = status.as_u16(),
                "Client error"
            );
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        self.log();

        let status = self.status_code();
        let error_response = ErrorResponse {
            code: self.error_code(),
            message: self.to_string(),
            details: self.details(),
        };

        (status, Json(error_response)).into_response()
    }
}

/// Result type alias for API operations
pub type ApiResult<T> = Result<T, ApiError>;

// ========== Conversion Implementations ==========

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<ApiError>() {
            Ok(api_err) => api_err,
            Err(err) => Self::Internal(err.to_string()),
        }
    }
}

impl From<DeviceValidationError> for ApiError {
    fn from(err: DeviceValidationError) -> Self {
        Self::ValidationError(err.to_string())
    }
}

impl From<CommandParseError> for ApiError {
    fn from(err: CommandParseError) -> Self {
        Self::ValidationError(err.to_string())
    }
}

impl From<lockstep_shared_config::ConfigError> for ApiError {
    fn from(err: lockstep_shared_config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ApiError::Unauthorized.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::not_found("session", "123").status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::expired("pairing bundle", "483920").status_code(),
            StatusCode::GONE
        );
        assert_eq!(
            ApiError::already_claimed("pairing code", "111111").status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::ValidationError("test".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(ApiError::Unauthorized.error_code(), "UNAUTHORIZED");
        assert_eq!(
            ApiError::not_found("device", "VR_#001").error_code(),
            "NOT_FOUND"
        );
        let bound = ApiError::AlreadyBound {
            code: "483920".to_string(),
            slot: "vr".to_string(),
            bound_device_id: "VR_#001".to_string(),
        };
        assert_eq!(bound.error_code(), "ALREADY_BOUND");
    }

    #[test]
    fn test_error_display() {
        let err = ApiError::not_found("session", "abc123");
        assert_eq!(err.to_string(), "session not found: abc123");
    }

    #[test]
    fn test_invalid_transition_carries_state() {
        let state = serde_json::json!({ "status": "stopped", "lastPositionMs": 4200 });
        let err = ApiError::invalid_transition("session", "pause", "stopped", &state);

        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert_eq!(err.error_code(), "INVALID_TRANSITION");
        assert_eq!(err.details(), Some(state));
        assert_eq!(
            err.to_string(),
            "cannot apply 'pause' to session in status 'stopped'"
        );
    }
}
