//! Durable store layer for Lockstep
//!
//! Every service talks to persistence through the [`Store`] trait. Two
//! backends implement it:
//! - [`PgStore`]: Postgres via sqlx, the production source of truth
//! - [`MemoryStore`]: in-process maps for tests and single-node runs
//!
//! Multi-row writes (`complete_bundle`, `create_session`, `commit_transition`,
//! `close_playback`) are all-or-nothing in both backends.

pub mod memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiResult;
use crate::models::{
    Device, DeviceKind, DevicePair, PairingBundle, PairingCode, PlaybackEntry, Session,
    SessionLog, SessionParticipant, UpsertDevice,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Offset/limit pagination for list queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pagination {
    pub offset: u64,
    pub limit: u64,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
        }
    }
}

impl Pagination {
    pub const MAX_LIMIT: u64 = 500;

    pub fn clamped(self) -> Self {
        Self {
            offset: self.offset,
            limit: self.limit.clamp(1, Self::MAX_LIMIT),
        }
    }
}

/// A paginated result set
#[derive(Debug, Clone, Serialize)]
pub struct PaginatedResult<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub offset: u64,
    pub limit: u64,
}

pub type SharedStore = Arc<dyn Store>;

#[async_trait]
pub trait Store: Send + Sync + 'static {
    // ----- devices -----

    /// Insert or refresh a device; `created_at` survives re-announces
    async fn upsert_device(&self, device: UpsertDevice, now: DateTime<Utc>) -> ApiResult<Device>;

    async fn get_device(&self, id: &str) -> ApiResult<Option<Device>>;

    async fn find_device_by_hardware_id(&self, hardware_id: &str) -> ApiResult<Option<Device>>;

    /// Advisory last-seen write; unknown ids are ignored
    async fn touch_device(&self, id: &str, at: DateTime<Utc>) -> ApiResult<()>;

    /// Next value of the per-kind display counter (1-based)
    async fn next_display_number(&self, kind: DeviceKind) -> ApiResult<u32>;

    async fn list_devices(&self, page: Pagination) -> ApiResult<PaginatedResult<Device>>;

    // ----- pairing codes and bundles -----

    /// Whether a live code or bundle already uses `code`
    async fn code_in_use(&self, code: &str, now: DateTime<Utc>) -> ApiResult<bool>;

    async fn insert_pairing_code(&self, code: &PairingCode) -> ApiResult<()>;

    async fn get_pairing_code(&self, code: &str) -> ApiResult<Option<PairingCode>>;

    /// Flip `claimed` if still unclaimed; false when someone got there first
    async fn mark_code_claimed(&self, code: &str, at: DateTime<Utc>) -> ApiResult<bool>;

    async fn insert_bundle(&self, bundle: &PairingBundle) -> ApiResult<()>;

    /// Most recently issued bundle carrying `code`
    async fn get_bundle_by_code(&self, code: &str) -> ApiResult<Option<PairingBundle>>;

    async fn update_bundle(&self, bundle: &PairingBundle) -> ApiResult<()>;

    /// Deactivate every other active pair holding either device, save `pair`
    /// as active and persist the completed bundle, in one transaction
    async fn complete_bundle(&self, bundle: &PairingBundle, pair: &DevicePair) -> ApiResult<()>;

    /// Remove uncompleted bundles and unclaimed codes past expiry
    async fn delete_expired_pairing(&self, now: DateTime<Utc>) -> ApiResult<u64>;

    // ----- pairs -----

    async fn get_pair(&self, id: Uuid) -> ApiResult<Option<DevicePair>>;

    async fn active_pair_for_device(&self, device_id: &str) -> ApiResult<Option<DevicePair>>;

    async fn deactivate_pair(&self, id: Uuid, at: DateTime<Utc>) -> ApiResult<Option<DevicePair>>;

    // ----- sessions -----

    /// Persist a new session with its participants and creation log
    async fn create_session(
        &self,
        session: &Session,
        participants: &[SessionParticipant],
        log: &SessionLog,
    ) -> ApiResult<()>;

    async fn get_session(&self, id: Uuid) -> ApiResult<Option<Session>>;

    async fn list_participants(&self, session_id: Uuid) -> ApiResult<Vec<SessionParticipant>>;

    /// Save the mutated session and participants and append the log entries
    /// atomically; on error nothing is written
    async fn commit_transition(
        &self,
        session: &Session,
        participants: &[SessionParticipant],
        logs: &[SessionLog],
    ) -> ApiResult<()>;

    /// Remove a session and everything scoped to it
    async fn delete_session(&self, id: Uuid) -> ApiResult<bool>;

    async fn append_log(&self, log: &SessionLog) -> ApiResult<()>;

    async fn list_logs(&self, session_id: Uuid, page: Pagination)
        -> ApiResult<PaginatedResult<SessionLog>>;

    // ----- telemetry -----

    /// Append a closed playback entry and write the participant aggregates
    async fn close_playback(
        &self,
        entry: &PlaybackEntry,
        participant: &SessionParticipant,
    ) -> ApiResult<()>;

    async fn list_playback_entries(&self, session_id: Uuid) -> ApiResult<Vec<PlaybackEntry>>;

    // ----- health -----

    async fn ping(&self) -> ApiResult<()>;
}
