//! Business logic services for Lockstep
//!
//! - Presence tracking for headsets and chairs
//! - Pairing codes, bundles and device pairs
//! - Session orchestration and command fan-out
//! - Sync/drift telemetry
//! - Operator token verification and health checks

pub mod auth;
pub mod clock;
pub mod commands;
pub mod health;
pub mod orchestrator;
pub mod pairing;
pub mod presence;
pub mod telemetry;

pub use auth::{AuthConfig, AuthService};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use commands::{CommandDispatcher, QueuedCommand};
pub use health::HealthService;
pub use orchestrator::SessionOrchestrator;
pub use pairing::PairingService;
pub use presence::{PresenceEvent, PresenceReason, PresenceTracker};
pub use telemetry::{DriftSample, EntryOutcome, SyncStats, TelemetryService};
