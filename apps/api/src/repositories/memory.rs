//! In-memory store for tests and single-node deployments
//!
//! All state sits behind one async mutex, so each trait call is atomic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{PaginatedResult, Pagination, Store};
use crate::error::{ApiError, ApiResult};
use crate::models::{
    Device, DeviceKind, DevicePair, PairingBundle, PairingCode, PlaybackEntry, Session,
    SessionLog, SessionParticipant, UpsertDevice,
};

#[derive(Default)]
struct Inner {
    devices: HashMap<String, Device>,
    counters: HashMap<DeviceKind, u32>,
    codes: Vec<PairingCode>,
    bundles: Vec<PairingBundle>,
    pairs: HashMap<Uuid, DevicePair>,
    sessions: HashMap<Uuid, Session>,
    participants: HashMap<Uuid, SessionParticipant>,
    logs: Vec<SessionLog>,
    entries: Vec<PlaybackEntry>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every subsequent write fail, to exercise rollback paths
    pub fn set_write_failure(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> ApiResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ApiError::Store("write rejected".to_string()));
        }
        Ok(())
    }
}

fn paginate<T: Clone>(items: Vec<T>, page: Pagination) -> PaginatedResult<T> {
    let page = page.clamped();
    let total = items.len() as u64;
    let items = items
        .into_iter()
        .skip(page.offset as usize)
        .take(page.limit as usize)
        .collect();
    PaginatedResult {
        items,
        total,
        offset: page.offset,
        limit: page.limit,
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_device(&self, device: UpsertDevice, now: DateTime<Utc>) -> ApiResult<Device> {
        self.check_writable()?;
        let mut inner = self.inner.lock().await;
        let record = match inner.devices.get(&device.id) {
            Some(existing) => Device {
                hardware_id: device.hardware_id.or_else(|| existing.hardware_id.clone()),
                kind: device.kind,
                metadata: device.metadata,
                last_seen_at: Some(now),
                ..existing.clone()
            },
            None => device.into_device(now),
        };
        inner.devices.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn get_device(&self, id: &str) -> ApiResult<Option<Device>> {
        Ok(self.inner.lock().await.devices.get(id).cloned())
    }

    async fn find_device_by_hardware_id(&self, hardware_id: &str) -> ApiResult<Option<Device>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .devices
            .values()
            .find(|d| d.hardware_id.as_deref() == Some(hardware_id))
            .cloned())
    }

    async fn touch_device(&self, id: &str, at: DateTime<Utc>) -> ApiResult<()> {
        self.check_writable()?;
        if let Some(device) = self.inner.lock().await.devices.get_mut(id) {
            device.last_seen_at = Some(at);
        }
        Ok(())
    }

    async fn next_display_number(&self, kind: DeviceKind) -> ApiResult<u32> {
        self.check_writable()?;
        let mut inner = self.inner.lock().await;
        let counter = inner.counters.entry(kind).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn list_devices(&self, page: Pagination) -> ApiResult<PaginatedResult<Device>> {
        let inner = self.inner.lock().await;
        let mut devices: Vec<Device> = inner.devices.values().cloned().collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(paginate(devices, page))
    }

    async fn code_in_use(&self, code: &str, now: DateTime<Utc>) -> ApiResult<bool> {
        let inner = self.inner.lock().await;
        let bundle_live = inner
            .bundles
            .iter()
            .any(|b| b.code == code && b.is_live(now));
        let code_live = inner
            .codes
            .iter()
            .any(|c| c.code == code && !c.claimed && !c.is_expired(now));
        Ok(bundle_live || code_live)
    }

    async fn insert_pairing_code(&self, code: &PairingCode) -> ApiResult<()> {
        self.check_writable()?;
        self.inner.lock().await.codes.push(code.clone());
        Ok(())
    }

    async fn get_pairing_code(&self, code: &str) -> ApiResult<Option<PairingCode>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .codes
            .iter()
            .filter(|c| c.code == code)
            .max_by_key(|c| c.created_at)
            .cloned())
    }

    async fn mark_code_claimed(&self, code: &str, at: DateTime<Utc>) -> ApiResult<bool> {
        self.check_writable()?;
        let mut inner = self.inner.lock().await;
        let latest = inner
            .codes
            .iter_mut()
            .filter(|c| c.code == code)
            .max_by_key(|c| c.created_at);
        match latest {
            Some(c) if !c.claimed => {
                c.claimed = true;
                c.claimed_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_bundle(&self, bundle: &PairingBundle) -> ApiResult<()> {
        self.check_writable()?;
        self.inner.lock().await.bundles.push(bundle.clone());
        Ok(())
    }

    async fn get_bundle_by_code(&self, code: &str) -> ApiResult<Option<PairingBundle>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .bundles
            .iter()
            .filter(|b| b.code == code)
            .max_by_key(|b| b.created_at)
            .cloned())
    }

    async fn update_bundle(&self, bundle: &PairingBundle) -> ApiResult<()> {
        self.check_writable()?;
        let mut inner = self.inner.lock().await;
        match inner.bundles.iter_mut().find(|b| b.id == bundle.id) {
            Some(existing) => {
                *existing = bundle.clone();
                Ok(())
            }
            None => Err(ApiError::not_found("pairing bundle", &bundle.code)),
        }
    }

    async fn complete_bundle(&self, bundle: &PairingBundle, pair: &DevicePair) -> ApiResult<()> {
        self.check_writable()?;
        let mut inner = self.inner.lock().await;
        if !inner.bundles.iter().any(|b| b.id == bundle.id) {
            return Err(ApiError::not_found("pairing bundle", &bundle.code));
        }

        for other in inner.pairs.values_mut() {
            if other.id != pair.id
                && other.is_active
                && (other.contains(&pair.vr_device_id) || other.contains(&pair.chair_device_id))
            {
                other.is_active = false;
                other.updated_at = pair.updated_at;
            }
        }
        inner.pairs.insert(pair.id, pair.clone());
        if let Some(existing) = inner.bundles.iter_mut().find(|b| b.id == bundle.id) {
            *existing = bundle.clone();
        }
        Ok(())
    }

    async fn delete_expired_pairing(&self, now: DateTime<Utc>) -> ApiResult<u64> {
        self.check_writable()?;
        let mut inner = self.inner.lock().await;
        let before = inner.bundles.len() + inner.codes.len();
        inner.bundles.retain(|b| !b.is_expired(now));
        inner.codes.retain(|c| c.claimed || !c.is_expired(now));
        Ok((before - inner.bundles.len() - inner.codes.len()) as u64)
    }

    async fn get_pair(&self, id: Uuid) -> ApiResult<Option<DevicePair>> {
        Ok(self.inner.lock().await.pairs.get(&id).cloned())
    }

    async fn active_pair_for_device(&self, device_id: &str) -> ApiResult<Option<DevicePair>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .pairs
            .values()
            .find(|p| p.is_active && p.contains(device_id))
            .cloned())
    }

    async fn deactivate_pair(&self, id: Uuid, at: DateTime<Utc>) -> ApiResult<Option<DevicePair>> {
        self.check_writable()?;
        let mut inner = self.inner.lock().await;
        Ok(inner.pairs.get_mut(&id).map(|pair| {
            pair.is_active = false;
            pair.updated_at = at;
            pair.clone()
        }))
    }

    async fn create_session(
        &self,
        session: &Session,
        participants: &[SessionParticipant],
        log: &SessionLog,
    ) -> ApiResult<()> {
        self.check_writable()?;
        let mut inner = self.inner.lock().await;
        inner.sessions.insert(session.id, session.clone());
        for participant in participants {
            inner.participants.insert(participant.id, participant.clone());
        }
        inner.logs.push(log.clone());
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> ApiResult<Option<Session>> {
        Ok(self.inner.lock().await.sessions.get(&id).cloned())
    }

    async fn list_participants(&self, session_id: Uuid) -> ApiResult<Vec<SessionParticipant>> {
        let inner = self.inner.lock().await;
        let mut participants: Vec<SessionParticipant> = inner
            .participants
            .values()
            .filter(|p| p.session_id == session_id)
            .cloned()
            .collect();
        participants.sort_by_key(|p| (p.joined_at, p.id));
        Ok(participants)
    }

    async fn commit_transition(
        &self,
        session: &Session,
        participants: &[SessionParticipant],
        logs: &[SessionLog],
    ) -> ApiResult<()> {
        self.check_writable()?;
        let mut inner = self.inner.lock().await;
        if !inner.sessions.contains_key(&session.id) {
            return Err(ApiError::not_found("session", session.id.to_string()));
        }
        inner.sessions.insert(session.id, session.clone());
        for participant in participants {
            inner.participants.insert(participant.id, participant.clone());
        }
        inner.logs.extend(logs.iter().cloned());
        Ok(())
    }

    async fn delete_session(&self, id: Uuid) -> ApiResult<bool> {
        self.check_writable()?;
        let mut inner = self.inner.lock().await;
        let existed = inner.sessions.remove(&id).is_some();
        inner.participants.retain(|_, p| p.session_id != id);
        inner.logs.retain(|l| l.session_id != id);
        inner.entries.retain(|e| e.session_id != id);
        Ok(existed)
    }

    async fn append_log(&self, log: &SessionLog) -> ApiResult<()> {
        self.check_writable()?;
        self.inner.lock().await.logs.push(log.clone());
        Ok(())
    }

    async fn list_logs(
        &self,
        session_id: Uuid,
        page: Pagination,
    ) -> ApiResult<PaginatedResult<SessionLog>> {
        let inner = self.inner.lock().await;
        let logs: Vec<SessionLog> = inner
            .logs
            .iter()
            .filter(|l| l.session_id == session_id)
            .cloned()
            .collect();
        Ok(paginate(logs, page))
    }

    async fn close_playback(
        &self,
        entry: &PlaybackEntry,
        participant: &SessionParticipant,
    ) -> ApiResult<()> {
        self.check_writable()?;
        let mut inner = self.inner.lock().await;
        if let Some(stored) = inner.participants.get_mut(&participant.id) {
            stored.sync_ok_rate = participant.sync_ok_rate;
            stored.avg_drift_ms = participant.avg_drift_ms;
            stored.max_drift_ms = participant.max_drift_ms;
        }
        inner.entries.push(entry.clone());
        Ok(())
    }

    async fn list_playback_entries(&self, session_id: Uuid) -> ApiResult<Vec<PlaybackEntry>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .entries
            .iter()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn ping(&self) -> ApiResult<()> {
        self.check_writable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SessionStatus;
    use chrono::Duration;

    #[tokio::test]
    async fn upsert_keeps_created_at_and_hardware_id() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        store
            .upsert_device(
                UpsertDevice::new("VR_#001", DeviceKind::Vr)
                    .with_hardware_id(Some("hw-1".to_string())),
                t0,
            )
            .await
            .unwrap();
        let later = t0 + Duration::seconds(30);
        let device = store
            .upsert_device(UpsertDevice::new("VR_#001", DeviceKind::Vr), later)
            .await
            .unwrap();

        assert_eq!(device.created_at, t0);
        assert_eq!(device.last_seen_at, Some(later));
        assert_eq!(device.hardware_id.as_deref(), Some("hw-1"));
        assert!(store
            .find_device_by_hardware_id("hw-1")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn display_counters_are_per_kind() {
        let store = MemoryStore::new();
        assert_eq!(store.next_display_number(DeviceKind::Vr).await.unwrap(), 1);
        assert_eq!(store.next_display_number(DeviceKind::Vr).await.unwrap(), 2);
        assert_eq!(store.next_display_number(DeviceKind::Chair).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn complete_bundle_deactivates_prior_pairs() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let old = DevicePair::new("VR_#001", "CHAIR_#009", now);
        let mut bundle = PairingBundle::new("111111".into(), Duration::seconds(120), None, now);
        store.insert_bundle(&bundle).await.unwrap();
        store.complete_bundle(&bundle, &old).await.unwrap();

        bundle.completed = true;
        let fresh = DevicePair::new("VR_#001", "CHAIR_#001", now);
        store.complete_bundle(&bundle, &fresh).await.unwrap();

        let old = store.get_pair(old.id).await.unwrap().unwrap();
        assert!(!old.is_active);
        let active = store.active_pair_for_device("VR_#001").await.unwrap().unwrap();
        assert_eq!(active.id, fresh.id);
    }

    #[tokio::test]
    async fn failed_commit_leaves_state_untouched() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut session = Session::new_individual(
            Uuid::new_v4(),
            "VR_#001",
            "CHAIR_#001",
            vec![],
            SessionStatus::Ready,
            now,
        );
        store
            .create_session(&session, &[], &SessionLog::new(session.id, "created", now))
            .await
            .unwrap();

        store.set_write_failure(true);
        session.status = SessionStatus::Running;
        let log = SessionLog::new(session.id, "start", now);
        assert!(store.commit_transition(&session, &[], &[log]).await.is_err());

        let stored = store.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Ready);
        let logs = store
            .list_logs(session.id, Pagination::default())
            .await
            .unwrap();
        assert_eq!(logs.total, 1);
    }

    #[tokio::test]
    async fn expired_pairing_is_swept() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let stale = PairingBundle::new("222222".into(), Duration::seconds(1), None, now);
        let live = PairingBundle::new("333333".into(), Duration::seconds(300), None, now);
        store.insert_bundle(&stale).await.unwrap();
        store.insert_bundle(&live).await.unwrap();

        let removed = store
            .delete_expired_pairing(now + Duration::seconds(5))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_bundle_by_code("222222").await.unwrap().is_none());
        assert!(store
            .code_in_use("333333", now + Duration::seconds(5))
            .await
            .unwrap());
    }
}
