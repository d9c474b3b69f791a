//! Authentication extractors for Axum handlers
//!
//! - `AuthUser`: requires a valid bearer token, returns 401 if missing/invalid
//! - `OperatorUser`: additionally requires the `admin` or `operator` role,
//!   returns 403 otherwise
//!
//! Both read the [`AuthService`] from request extensions.
//!
//! ```rust,ignore
//! async fn pause(operator: OperatorUser) -> impl IntoResponse {
//!     format!("{} paused the session", operator.claims.sub)
//! }
//! ```

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

use crate::error::{ApiError, ErrorResponse};
use crate::services::auth::{AuthService, Claims};

/// Any authenticated caller
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub claims: Claims,
}

/// Caller allowed to issue commands
#[derive(Debug, Clone)]
pub struct OperatorUser {
    pub claims: Claims,
}

/// Authentication rejection types
#[derive(Debug)]
pub enum AuthRejection {
    /// Missing or invalid Authorization header
    MissingToken,
    /// Token is malformed or expired
    InvalidToken(String),
    /// Caller's role may not perform the operation
    InsufficientPermissions,
    /// Missing required services in app state
    MissingServices,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            AuthRejection::MissingToken => {
                tracing::debug!("Authentication rejected: missing token");
                (StatusCode::UNAUTHORIZED, ApiError::Unauthorized)
            }
            AuthRejection::InvalidToken(reason) => {
                tracing::debug!(reason = %reason, "Authentication rejected: invalid token");
                (StatusCode::UNAUTHORIZED, ApiError::InvalidToken(reason))
            }
            AuthRejection::InsufficientPermissions => {
                tracing::warn!("Authentication rejected: insufficient permissions");
                (
                    StatusCode::FORBIDDEN,
                    ApiError::Forbidden("operator access required".to_string()),
                )
            }
            AuthRejection::MissingServices => {
                tracing::error!("Authentication rejected: missing services in app state");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ApiError::Internal("Authentication services not configured".to_string()),
                )
            }
        };

        let body = Json(ErrorResponse {
            code: error.error_code(),
            message: error.to_string(),
            details: None,
        });

        (status, body).into_response()
    }
}

/// Extract the bearer token from the Authorization header
fn extract_bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
}

fn verify(parts: &Parts) -> Result<Claims, AuthRejection> {
    let token = extract_bearer_token(parts).ok_or(AuthRejection::MissingToken)?;

    let auth_service = parts
        .extensions
        .get::<AuthService>()
        .ok_or(AuthRejection::MissingServices)?;

    auth_service
        .verify_access_token(token)
        .map_err(|e| AuthRejection::InvalidToken(e.to_string()))
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(AuthUser {
            claims: verify(parts)?,
        })
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for OperatorUser
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let claims = verify(parts)?;
        if !claims.role.can_command() {
            return Err(AuthRejection::InsufficientPermissions);
        }
        Ok(OperatorUser { claims })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::auth::{AuthConfig, Role};
    use axum::http::Request;

    fn parts_with(token: Option<&str>, auth: Option<AuthService>) -> Parts {
        let mut builder = Request::builder().uri("/sessions");
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        if let Some(auth) = auth {
            parts.extensions.insert(auth);
        }
        parts
    }

    fn auth() -> AuthService {
        AuthService::new(AuthConfig::new("middleware-test-secret-0123456789".into()))
    }

    #[tokio::test]
    async fn test_missing_token() {
        let mut parts = parts_with(None, Some(auth()));
        let result = AuthUser::from_request_parts(&mut parts, &()).await;
        assert!(matches!(result, Err(AuthRejection::MissingToken)));
    }

    #[tokio::test]
    async fn test_viewer_is_authenticated_but_not_operator() {
        let service = auth();
        let token = service.issue_token("viewer-1", Role::Viewer).unwrap();

        let mut parts = parts_with(Some(&token), Some(service.clone()));
        assert!(AuthUser::from_request_parts(&mut parts, &()).await.is_ok());

        let mut parts = parts_with(Some(&token), Some(service));
        let result = OperatorUser::from_request_parts(&mut parts, &()).await;
        assert!(matches!(result, Err(AuthRejection::InsufficientPermissions)));
    }

    #[tokio::test]
    async fn test_operator_accepted() {
        let service = auth();
        let token = service.issue_token("ops-1", Role::Operator).unwrap();
        let mut parts = parts_with(Some(&token), Some(service));
        let operator = OperatorUser::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(operator.claims.sub, "ops-1");
    }

    #[tokio::test]
    async fn test_missing_service() {
        let mut parts = parts_with(Some("abc"), None);
        let result = AuthUser::from_request_parts(&mut parts, &()).await;
        assert!(matches!(result, Err(AuthRejection::MissingServices)));
    }
}
