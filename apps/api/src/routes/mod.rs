//! HTTP route handlers for the Lockstep API
//!
//! Each area gets its own router and state, nested under its prefix by
//! [`crate::app::AppState::router`]:
//! - `/health`: liveness and readiness
//! - `/devices`: registry, presence view, HTTP publish
//! - `/pairing`: bundles, legacy codes, pair deactivation
//! - `/sessions`: orchestration, participant commands, progress, stats
//! - `/commands`: polling fallback for device commands

pub mod commands;
pub mod devices;
pub mod health;
pub mod pairing;
pub mod sessions;

pub use commands::{commands_router, CommandsState};
pub use devices::{devices_router, DevicesState};
pub use health::{health_router, HealthState};
pub use pairing::{pairing_router, PairingState};
pub use sessions::{sessions_router, SessionsState};
