//! Presence tracker
//!
//! Live online/offline view of every device, fed by heartbeats, status
//! messages, announces and bridge connections regardless of transport. The
//! view is in memory only and starts empty on restart; the store keeps an
//! advisory `last_seen_at`.
//!
//! Each device's deadline rearm and expiry check run under the same
//! [`DashMap`] entry lock, so a sweep never races a heartbeat into emitting
//! a stale offline edge.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::ApiResult;
use crate::models::{validate_device_id, Device, DeviceKind, UpsertDevice};
use crate::repositories::SharedStore;
use crate::services::clock::SharedClock;
use crate::transport::messages::{AnnouncePayload, HeartbeatPayload, StatusPayload};

const EVENT_CAPACITY: usize = 1024;

/// What caused a presence change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceReason {
    Heartbeat,
    Status,
    Announce,
    Bridge,
    Timeout,
    LastWill,
    Disconnect,
}

/// One online/offline edge
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEvent {
    pub device_id: String,
    pub kind: DeviceKind,
    pub online: bool,
    pub reason: PresenceReason,
    pub at: DateTime<Utc>,
}

/// Snapshot row for one device
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DevicePresence {
    pub device_id: String,
    pub kind: DeviceKind,
    pub online: bool,
    pub last_seen_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct PresenceEntry {
    kind: DeviceKind,
    online: bool,
    last_seen_at: DateTime<Utc>,
    deadline: DateTime<Utc>,
}

pub struct PresenceTracker {
    entries: DashMap<String, PresenceEntry>,
    store: SharedStore,
    clock: SharedClock,
    timeout: Duration,
    events: broadcast::Sender<PresenceEvent>,
}

impl PresenceTracker {
    pub fn new(store: SharedStore, clock: SharedClock, timeout: Duration) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            entries: DashMap::new(),
            store,
            clock,
            timeout,
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PresenceEvent> {
        self.events.subscribe()
    }

    /// Single constructor path for devices: validate, persist, mark seen
    pub async fn upsert_device(
        &self,
        device_id: &str,
        kind: DeviceKind,
        hardware_id: Option<String>,
        metadata: serde_json::Value,
    ) -> ApiResult<Device> {
        let metadata = if metadata.is_null() {
            serde_json::Value::Object(Default::default())
        } else {
            metadata
        };
        let upsert = UpsertDevice::new(device_id, kind)
            .with_hardware_id(hardware_id)
            .with_metadata(metadata);
        upsert.validate()?;

        let device = self.store.upsert_device(upsert, self.clock.now()).await?;
        self.touch(&device.id, device.kind, PresenceReason::Announce);
        Ok(device)
    }

    pub async fn record_heartbeat(&self, device_id: &str, payload: HeartbeatPayload) {
        if let Err(e) = validate_device_id(device_id) {
            tracing::warn!(device_id = %device_id, error = %e, "Ignoring heartbeat from invalid device id");
            return;
        }

        if let Some(kind) = self.known_kind(device_id) {
            self.touch(device_id, kind, PresenceReason::Heartbeat);
            return;
        }

        // first sight since restart
        match self.resolve_kind(device_id, payload.kind).await {
            Some((kind, true)) => {
                self.touch(device_id, kind, PresenceReason::Heartbeat);
            }
            Some((kind, false)) => {
                if let Err(e) = self
                    .upsert_device(device_id, kind, payload.hardware_id, serde_json::Value::Null)
                    .await
                {
                    tracing::warn!(device_id = %device_id, error = %e, "Failed to register device from heartbeat");
                    self.touch(device_id, kind, PresenceReason::Heartbeat);
                }
            }
            None => {
                tracing::warn!(device_id = %device_id, "Ignoring heartbeat: device kind unknown");
            }
        }
    }

    pub async fn record_status(&self, device_id: &str, payload: StatusPayload) {
        if let Err(e) = validate_device_id(device_id) {
            tracing::warn!(device_id = %device_id, error = %e, "Ignoring status from invalid device id");
            return;
        }

        if payload.is_offline() {
            self.force_offline(device_id, PresenceReason::LastWill);
            return;
        }

        let kind = match self.known_kind(device_id) {
            Some(kind) => Some(kind),
            None => self
                .resolve_kind(device_id, payload.kind)
                .await
                .map(|(kind, _)| kind),
        };
        match kind {
            Some(kind) => {
                self.touch(device_id, kind, PresenceReason::Status);
            }
            None => tracing::warn!(device_id = %device_id, "Ignoring status: device kind unknown"),
        }
    }

    pub async fn record_announce(&self, payload: AnnouncePayload) -> ApiResult<Device> {
        self.upsert_device(
            &payload.device_id,
            payload.kind,
            payload.hardware_id,
            payload.metadata,
        )
        .await
    }

    /// Mark a device seen over a bridge socket
    pub fn record_bridge(&self, device_id: &str, kind: DeviceKind) {
        self.touch(device_id, kind, PresenceReason::Bridge);
    }

    pub fn is_online(&self, device_id: &str) -> bool {
        let now = self.clock.now();
        self.entries
            .get(device_id)
            .map(|entry| entry.online && now < entry.deadline)
            .unwrap_or(false)
    }

    pub fn all_online<'a>(&self, device_ids: impl IntoIterator<Item = &'a str>) -> bool {
        device_ids.into_iter().all(|id| self.is_online(id))
    }

    pub fn snapshot(&self) -> Vec<DevicePresence> {
        let now = self.clock.now();
        let mut rows: Vec<DevicePresence> = self
            .entries
            .iter()
            .map(|entry| DevicePresence {
                device_id: entry.key().clone(),
                kind: entry.kind,
                online: entry.online && now < entry.deadline,
                last_seen_at: entry.last_seen_at,
                deadline: entry.deadline,
            })
            .collect();
        rows.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        rows
    }

    /// Flip a device offline now, ahead of its deadline
    pub fn force_offline(&self, device_id: &str, reason: PresenceReason) -> bool {
        let now = self.clock.now();
        let event = {
            let Some(mut entry) = self.entries.get_mut(device_id) else {
                return false;
            };
            if !entry.online {
                return false;
            }
            entry.online = false;
            PresenceEvent {
                device_id: device_id.to_string(),
                kind: entry.kind,
                online: false,
                reason,
                at: now,
            }
        };
        tracing::info!(device_id = %device_id, reason = ?reason, "Device offline");
        let _ = self.events.send(event);
        true
    }

    /// Drop a device from the live view without emitting an event
    pub fn forget(&self, device_id: &str) {
        self.entries.remove(device_id);
    }

    /// Flip every expired device offline; one event per edge
    pub fn sweep(&self) -> Vec<PresenceEvent> {
        let now = self.clock.now();
        let mut expired = Vec::new();

        for mut entry in self.entries.iter_mut() {
            if entry.online && now >= entry.deadline {
                entry.online = false;
                expired.push(PresenceEvent {
                    device_id: entry.key().clone(),
                    kind: entry.kind,
                    online: false,
                    reason: PresenceReason::Timeout,
                    at: now,
                });
            }
        }

        for event in &expired {
            tracing::info!(device_id = %event.device_id, "Device offline after heartbeat timeout");
            let _ = self.events.send(event.clone());
        }
        expired
    }

    /// Run [`Self::sweep`] every `interval` until shutdown
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: std::time::Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        tracker.sweep();
                    }
                }
            }
            tracing::debug!("Presence sweeper stopped");
        })
    }

    /// Persist advisory `last_seen_at` on every edge
    pub fn spawn_last_seen_writer(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let store = self.store.clone();
        let mut events = self.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(event) => {
                        if let Err(e) = store.touch_device(&event.device_id, event.at).await {
                            tracing::debug!(device_id = %event.device_id, error = %e, "Failed to persist last seen");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Last-seen writer lagged behind presence events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    pub fn known_kind(&self, device_id: &str) -> Option<DeviceKind> {
        self.entries.get(device_id).map(|entry| entry.kind)
    }

    /// Kind from the store, then the payload, then the id prefix; the flag
    /// says whether the store already has the device
    async fn resolve_kind(
        &self,
        device_id: &str,
        hinted: Option<DeviceKind>,
    ) -> Option<(DeviceKind, bool)> {
        match self.store.get_device(device_id).await {
            Ok(Some(device)) => return Some((device.kind, true)),
            Ok(None) => {}
            Err(e) => tracing::warn!(device_id = %device_id, error = %e, "Device lookup failed"),
        }
        hinted
            .or_else(|| DeviceKind::infer_from_device_id(device_id))
            .map(|kind| (kind, false))
    }

    /// Record a sighting and rearm the deadline; emits on offline -> online
    ///
    /// A device whose deadline passed before the sweeper reached it gets its
    /// timeout edge here first, so every gap still yields one offline event.
    fn touch(&self, device_id: &str, kind: DeviceKind, reason: PresenceReason) -> bool {
        let now = self.clock.now();
        let deadline = now + self.timeout;

        let (timed_out, came_online) = {
            let mut entry = self
                .entries
                .entry(device_id.to_string())
                .or_insert_with(|| PresenceEntry {
                    kind,
                    online: false,
                    last_seen_at: now,
                    deadline,
                });
            let timed_out = (entry.online && now >= entry.deadline).then(|| PresenceEvent {
                device_id: device_id.to_string(),
                kind: entry.kind,
                online: false,
                reason: PresenceReason::Timeout,
                at: entry.deadline,
            });
            let came_online = !entry.online || timed_out.is_some();
            entry.last_seen_at = now;
            entry.deadline = deadline;
            entry.online = true;
            (timed_out, came_online)
        };

        if let Some(event) = timed_out {
            tracing::info!(device_id = %device_id, "Device offline after heartbeat timeout");
            let _ = self.events.send(event);
        }
        if came_online {
            tracing::info!(device_id = %device_id, reason = ?reason, "Device online");
            let _ = self.events.send(PresenceEvent {
                device_id: device_id.to_string(),
                kind,
                online: true,
                reason,
                at: now,
            });
        }
        came_online
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::{MemoryStore, Store};
    use crate::services::clock::{Clock, ManualClock};
    use tracing_test::traced_test;

    fn tracker() -> (Arc<PresenceTracker>, Arc<ManualClock>, Arc<MemoryStore>) {
        let clock = Arc::new(ManualClock::default());
        let store = MemoryStore::new();
        let tracker = PresenceTracker::new(store.clone(), clock.clone(), Duration::seconds(30));
        (tracker, clock, store)
    }

    #[tokio::test]
    async fn test_heartbeats_within_window_stay_online() {
        let (tracker, clock, _) = tracker();
        let mut events = tracker.subscribe();

        for _ in 0..5 {
            tracker
                .record_heartbeat("VR_#001", HeartbeatPayload::default())
                .await;
            clock.advance(Duration::seconds(20));
            assert!(tracker.sweep().is_empty());
            assert!(tracker.is_online("VR_#001"));
        }

        let first = events.try_recv().unwrap();
        assert!(first.online);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_timeout_emits_exactly_one_offline_event() {
        let (tracker, clock, _) = tracker();
        tracker
            .record_heartbeat("CHAIR_#001", HeartbeatPayload::default())
            .await;
        let mut events = tracker.subscribe();

        clock.advance(Duration::seconds(30));
        assert!(!tracker.is_online("CHAIR_#001"));

        let swept = tracker.sweep();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].reason, PresenceReason::Timeout);
        assert!(tracker.sweep().is_empty());

        let event = events.try_recv().unwrap();
        assert!(!event.online);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_heartbeat_after_unswept_gap_emits_offline_edge() {
        let (tracker, clock, _) = tracker();
        tracker
            .record_heartbeat("VR_#001", HeartbeatPayload::default())
            .await;
        let mut events = tracker.subscribe();
        let deadline = clock.now() + Duration::seconds(30);

        // the gap ends before any sweep runs
        clock.advance(Duration::seconds(33));
        assert!(!tracker.is_online("VR_#001"));
        tracker
            .record_heartbeat("VR_#001", HeartbeatPayload::default())
            .await;
        assert!(tracker.is_online("VR_#001"));
        assert!(tracker.sweep().is_empty());

        let offline = events.try_recv().unwrap();
        assert!(!offline.online);
        assert_eq!(offline.reason, PresenceReason::Timeout);
        assert_eq!(offline.at, deadline);
        let online = events.try_recv().unwrap();
        assert!(online.online);
        assert_eq!(online.reason, PresenceReason::Heartbeat);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_last_will_forces_offline() {
        let (tracker, _, _) = tracker();
        tracker
            .record_heartbeat("VR_#001", HeartbeatPayload::default())
            .await;

        let status: StatusPayload =
            serde_json::from_value(serde_json::json!({ "status": "offline" })).unwrap();
        tracker.record_status("VR_#001", status).await;

        assert!(!tracker.is_online("VR_#001"));
        assert!(tracker.sweep().is_empty());
        assert!(!tracker.force_offline("VR_#001", PresenceReason::Disconnect));
    }

    #[tokio::test]
    async fn test_heartbeat_registers_unknown_device() {
        let (tracker, _, store) = tracker();
        tracker
            .record_heartbeat("VR_#007", HeartbeatPayload::default())
            .await;

        let device = store.get_device("VR_#007").await.unwrap().unwrap();
        assert_eq!(device.kind, DeviceKind::Vr);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_unknown_kind_is_ignored() {
        let (tracker, _, _) = tracker();
        tracker
            .record_heartbeat("sensor-9", HeartbeatPayload::default())
            .await;
        tracker
            .record_heartbeat("bad/id", HeartbeatPayload::default())
            .await;
        assert!(tracker.snapshot().is_empty());
        assert!(logs_contain("device kind unknown"));
        assert!(logs_contain("invalid device id"));
    }

    #[tokio::test]
    async fn test_announce_upserts_and_marks_online() {
        let (tracker, _, store) = tracker();
        let payload: AnnouncePayload = serde_json::from_value(serde_json::json!({
            "deviceId": "lobby-headset",
            "kind": "vr",
            "hardwareId": "HW-1",
            "metadata": { "firmware": "2.1" }
        }))
        .unwrap();

        let device = tracker.record_announce(payload).await.unwrap();
        assert_eq!(device.hardware_id.as_deref(), Some("HW-1"));
        assert!(tracker.is_online("lobby-headset"));
        assert!(store.get_device("lobby-headset").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_forget_and_snapshot() {
        let (tracker, _, _) = tracker();
        tracker.record_bridge("VR_#001", DeviceKind::Vr);
        tracker.record_bridge("CHAIR_#001", DeviceKind::Chair);

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].device_id, "CHAIR_#001");

        tracker.forget("CHAIR_#001");
        assert_eq!(tracker.snapshot().len(), 1);
    }
}
