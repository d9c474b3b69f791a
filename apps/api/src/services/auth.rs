//! Operator token verification
//!
//! Identity lives with an external provider; this service only checks the
//! HS256 bearer tokens it hands out and reads the caller's role from them.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};

/// Caller role carried in the token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Operator,
    Viewer,
}

impl Role {
    /// Only admins and operators may drive devices
    pub fn can_command(&self) -> bool {
        matches!(self, Self::Admin | Self::Operator)
    }
}

/// JWT claims for operator tokens
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Principal id from the identity provider
    pub sub: String,
    pub role: Role,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
    pub aud: String,
}

/// Authentication service configuration
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// JWT signing secret
    pub jwt_secret: String,
    /// Token TTL in seconds for locally issued tokens (default: 12 hours)
    pub token_ttl_secs: i64,
    pub issuer: String,
    pub audience: String,
}

impl AuthConfig {
    pub fn new(jwt_secret: String) -> Self {
        Self {
            jwt_secret,
            token_ttl_secs: 12 * 3600,
            issuer: "lockstep".to_string(),
            audience: "lockstep".to_string(),
        }
    }
}

#[derive(Clone)]
pub struct AuthService {
    config: AuthConfig,
}

impl AuthService {
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    /// Sign a token for `subject`; used by tooling and tests
    pub fn issue_token(&self, subject: &str, role: Role) -> ApiResult<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: subject.to_string(),
            role,
            iat: now.timestamp(),
            exp: (now + Duration::seconds(self.config.token_ttl_secs)).timestamp(),
            iss: self.config.issuer.clone(),
            aud: self.config.audience.clone(),
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.config.jwt_secret.as_bytes()),
        )?;
        Ok(token)
    }

    /// Verify a bearer token and return its claims
    ///
    /// # Errors
    /// - `ApiError::InvalidToken` if token is invalid, expired, or malformed
    pub fn verify_access_token(&self, token: &str) -> ApiResult<Claims> {
        let mut validation = Validation::default();
        validation.set_issuer(&[&self.config.issuer]);
        validation.set_audience(&[&self.config.audience]);

        let token_data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.config.jwt_secret.as_bytes()),
            &validation,
        )
        .map_err(|e| {
            tracing::debug!(error = %e, "Access token verification failed");
            ApiError::InvalidToken(e.to_string())
        })?;

        Ok(token_data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> AuthService {
        AuthService::new(AuthConfig::new("a-test-secret-of-reasonable-length!".into()))
    }

    #[test]
    fn test_issue_and_verify() {
        let auth = service();
        let token = auth.issue_token("ops-1", Role::Operator).unwrap();
        let claims = auth.verify_access_token(&token).unwrap();
        assert_eq!(claims.sub, "ops-1");
        assert_eq!(claims.role, Role::Operator);
        assert!(claims.role.can_command());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = service().issue_token("ops-1", Role::Admin).unwrap();
        let other = AuthService::new(AuthConfig::new("a-different-secret-entirely-here!!".into()));
        assert!(matches!(
            other.verify_access_token(&token),
            Err(ApiError::InvalidToken(_))
        ));
    }

    #[test]
    fn test_viewer_cannot_command() {
        assert!(!Role::Viewer.can_command());
        assert!(Role::Admin.can_command());
    }

    #[test]
    fn test_garbage_token() {
        assert!(service().verify_access_token("not.a.jwt").is_err());
    }
}
