//! Lockstep API library
//!
//! Coordinates VR headsets and motion chairs: presence, pairing, session
//! orchestration and sync telemetry. Exposed as a library for the binary
//! and the integration tests.

pub mod app;
pub mod config;
pub mod error;
pub mod middleware;
pub mod models;
pub mod repositories;
pub mod routes;
pub mod services;
pub mod transport;

// Re-export commonly used types
pub use app::AppState;
pub use config::{Config, Policy};
pub use error::{ApiError, ApiResult, ErrorResponse};
pub use services::{AuthConfig, AuthService};
