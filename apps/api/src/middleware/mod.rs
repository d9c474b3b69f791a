//! Middleware components for the Lockstep API
//!
//! Authentication extractors for Axum handlers:
//! - `AuthUser`: requires valid authentication, returns 401 if missing/invalid
//! - `OperatorUser`: requires the admin or operator role, returns 403 otherwise

pub mod auth;

pub use auth::{AuthRejection, AuthUser, OperatorUser};
