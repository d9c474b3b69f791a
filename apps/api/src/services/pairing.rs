//! Pairing workflow
//!
//! Two flows share one six-digit code space:
//! - bundles: an operator issues a code, the VR unit and the chair each claim
//!   their slot, and the second claim completes the bundle into a
//!   [`DevicePair`]
//! - legacy codes: a single device claims a code with its hardware id and
//!   receives a sequential display id such as `VR_#004`
//!
//! Claims on the same code are serialized; claims on different codes run in
//! parallel.

use std::sync::Arc;

use chrono::Duration;
use dashmap::DashMap;
use rand::Rng;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Policy;
use crate::error::{ApiError, ApiResult};
use crate::models::pairing::{default_pair_name, is_well_formed_code};
use crate::models::{
    validate_device_id, BundleState, Device, DeviceKind, DevicePair, IssuedCode, PairingBundle,
    PairingCode,
};
use crate::repositories::SharedStore;
use crate::services::clock::SharedClock;
use crate::services::presence::PresenceTracker;

/// Attempts at drawing an unused code before giving up
const MAX_CODE_ATTEMPTS: usize = 32;

/// Attempts at finding a free display id for a new device
const MAX_DISPLAY_ID_ATTEMPTS: usize = 1000;

pub struct PairingService {
    store: SharedStore,
    clock: SharedClock,
    presence: Arc<PresenceTracker>,
    bundle_ttl: Duration,
    code_ttl: Duration,
    /// Held while drawing and inserting a code so two issues never collide
    issue_lock: Mutex<()>,
    claim_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl PairingService {
    pub fn new(
        store: SharedStore,
        clock: SharedClock,
        presence: Arc<PresenceTracker>,
        policy: &Policy,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            clock,
            presence,
            bundle_ttl: policy.pairing_bundle_ttl(),
            code_ttl: policy.pairing_code_ttl(),
            issue_lock: Mutex::new(()),
            claim_locks: DashMap::new(),
        })
    }

    // =========================================================================
    // Bundles
    // =========================================================================

    /// Issue a bundle code, optionally re-binding an existing pair in place
    pub async fn issue_bundle(&self, target_pair_id: Option<Uuid>) -> ApiResult<IssuedCode> {
        if let Some(pair_id) = target_pair_id {
            if self.store.get_pair(pair_id).await?.is_none() {
                return Err(ApiError::not_found("pair", pair_id.to_string()));
            }
        }

        let _guard = self.issue_lock.lock().await;
        let now = self.clock.now();
        let code = self.draw_unused_code().await?;
        let bundle = PairingBundle::new(code, self.bundle_ttl, target_pair_id, now);
        self.store.insert_bundle(&bundle).await?;

        tracing::info!(
            code = %bundle.code,
            expires_at = %bundle.expires_at,
            target_pair_id = ?target_pair_id,
            "Pairing bundle issued"
        );

        Ok(IssuedCode {
            code: bundle.code,
            expires_at: bundle.expires_at,
        })
    }

    /// Claim the `kind` slot of a bundle for `device_id`
    pub async fn claim(
        &self,
        code: &str,
        device_id: &str,
        kind: DeviceKind,
    ) -> ApiResult<BundleState> {
        if !is_well_formed_code(code) {
            return Err(ApiError::ValidationError(format!(
                "pairing code must be 6 digits, got '{}'",
                code
            )));
        }
        validate_device_id(device_id)?;

        let lock = self.claim_lock(code);
        let result = {
            let _guard = lock.lock().await;
            self.claim_locked(code, device_id, kind).await
        };
        drop(lock);
        self.release_claim_lock(code);
        result
    }

    async fn claim_locked(
        &self,
        code: &str,
        device_id: &str,
        kind: DeviceKind,
    ) -> ApiResult<BundleState> {
        let mut bundle = self
            .store
            .get_bundle_by_code(code)
            .await?
            .ok_or_else(|| ApiError::not_found("pairing bundle", code))?;
        let now = self.clock.now();

        if bundle.completed {
            if bundle.slot(kind) == Some(device_id) {
                let pair = self.completed_pair(&bundle).await?;
                return Ok(BundleState::from_bundle(&bundle, pair, now));
            }
            return Err(ApiError::already_claimed("pairing bundle", code));
        }

        if bundle.is_expired(now) {
            return Err(ApiError::expired("pairing bundle", code));
        }

        match bundle.slot(kind) {
            Some(bound) if bound == device_id => {
                return Ok(BundleState::from_bundle(&bundle, None, now));
            }
            Some(bound) => {
                return Err(ApiError::AlreadyBound {
                    code: code.to_string(),
                    slot: kind.to_string(),
                    bound_device_id: bound.to_string(),
                });
            }
            None => {}
        }

        let other = match kind {
            DeviceKind::Vr => DeviceKind::Chair,
            DeviceKind::Chair => DeviceKind::Vr,
        };
        if bundle.slot(other) == Some(device_id) {
            return Err(ApiError::ValidationError(format!(
                "device {} already holds the {} slot",
                device_id, other
            )));
        }

        self.ensure_device(device_id, kind).await?;
        bundle.set_slot(kind, device_id);

        let (Some(vr), Some(chair)) = (bundle.vr_device_id.clone(), bundle.chair_device_id.clone())
        else {
            self.store.update_bundle(&bundle).await?;
            tracing::info!(code = %code, device_id = %device_id, slot = %kind, "Bundle slot claimed");
            return Ok(BundleState::from_bundle(&bundle, None, now));
        };

        let pair = self.pair_for_completion(&bundle, vr, chair).await?;
        bundle.completed = true;
        bundle.completed_at = Some(now);
        self.store.complete_bundle(&bundle, &pair).await?;

        tracing::info!(
            code = %code,
            pair_id = %pair.id,
            vr_device_id = %pair.vr_device_id,
            chair_device_id = %pair.chair_device_id,
            "Pairing bundle completed"
        );

        Ok(BundleState::from_bundle(&bundle, Some(pair), now))
    }

    /// New pair, or the target pair rebound to the claimed devices
    async fn pair_for_completion(
        &self,
        bundle: &PairingBundle,
        vr: String,
        chair: String,
    ) -> ApiResult<DevicePair> {
        let now = self.clock.now();
        let target = match bundle.target_pair_id {
            Some(pair_id) => self.store.get_pair(pair_id).await?,
            None => None,
        };
        Ok(match target {
            Some(mut pair) => {
                // keep a name the operator chose, regenerate a derived one
                if pair.name == default_pair_name(&pair.vr_device_id, &pair.chair_device_id) {
                    pair.name = default_pair_name(&vr, &chair);
                }
                pair.vr_device_id = vr;
                pair.chair_device_id = chair;
                pair.is_active = true;
                pair.updated_at = now;
                pair
            }
            None => DevicePair::new(vr, chair, now),
        })
    }

    async fn completed_pair(&self, bundle: &PairingBundle) -> ApiResult<Option<DevicePair>> {
        let (Some(vr), Some(chair)) = (&bundle.vr_device_id, &bundle.chair_device_id) else {
            return Ok(None);
        };
        Ok(self
            .store
            .active_pair_for_device(vr)
            .await?
            .filter(|pair| pair.contains(chair)))
    }

    /// Register an unknown device; reject one whose stored kind disagrees
    async fn ensure_device(&self, device_id: &str, kind: DeviceKind) -> ApiResult<()> {
        match self.store.get_device(device_id).await? {
            Some(device) if device.kind != kind => Err(ApiError::ValidationError(format!(
                "device {} is a {} unit, not {}",
                device_id, device.kind, kind
            ))),
            Some(_) => Ok(()),
            None => {
                self.presence
                    .upsert_device(device_id, kind, None, serde_json::Value::Null)
                    .await?;
                Ok(())
            }
        }
    }

    // =========================================================================
    // Legacy single-device codes
    // =========================================================================

    pub async fn issue_code(&self, kind: DeviceKind) -> ApiResult<IssuedCode> {
        let _guard = self.issue_lock.lock().await;
        let now = self.clock.now();
        let code = self.draw_unused_code().await?;
        let record = PairingCode {
            code,
            kind,
            expires_at: now + self.code_ttl,
            claimed: false,
            claimed_at: None,
            created_at: now,
        };
        self.store.insert_pairing_code(&record).await?;

        tracing::info!(code = %record.code, kind = %kind, "Pairing code issued");

        Ok(IssuedCode {
            code: record.code,
            expires_at: record.expires_at,
        })
    }

    /// Claim a legacy code and hand back the device it names
    pub async fn claim_code(
        &self,
        code: &str,
        hardware_id: &str,
        metadata: serde_json::Value,
    ) -> ApiResult<Device> {
        if !is_well_formed_code(code) {
            return Err(ApiError::ValidationError(format!(
                "pairing code must be 6 digits, got '{}'",
                code
            )));
        }
        if hardware_id.trim().is_empty() {
            return Err(ApiError::ValidationError("hardwareId is required".to_string()));
        }

        let key = format!("code:{}", code);
        let lock = self.claim_lock(&key);
        let result = {
            let _guard = lock.lock().await;
            self.claim_code_locked(code, hardware_id, metadata).await
        };
        drop(lock);
        self.release_claim_lock(&key);
        result
    }

    async fn claim_code_locked(
        &self,
        code: &str,
        hardware_id: &str,
        metadata: serde_json::Value,
    ) -> ApiResult<Device> {
        let record = self
            .store
            .get_pairing_code(code)
            .await?
            .ok_or_else(|| ApiError::not_found("pairing code", code))?;
        let now = self.clock.now();

        if record.claimed {
            return Err(ApiError::already_claimed("pairing code", code));
        }
        if record.is_expired(now) {
            return Err(ApiError::expired("pairing code", code));
        }

        let device_id = match self.store.find_device_by_hardware_id(hardware_id).await? {
            Some(device) if device.kind != record.kind => {
                return Err(ApiError::ValidationError(format!(
                    "hardware {} is registered as a {} unit",
                    hardware_id, device.kind
                )));
            }
            Some(device) => device.id,
            None => self.allocate_display_id(record.kind).await?,
        };

        if !self.store.mark_code_claimed(code, now).await? {
            return Err(ApiError::already_claimed("pairing code", code));
        }

        let device = self
            .presence
            .upsert_device(&device_id, record.kind, Some(hardware_id.to_string()), metadata)
            .await?;

        tracing::info!(code = %code, device_id = %device.id, "Pairing code claimed");
        Ok(device)
    }

    async fn allocate_display_id(&self, kind: DeviceKind) -> ApiResult<String> {
        for _ in 0..MAX_DISPLAY_ID_ATTEMPTS {
            let candidate = kind.display_id(self.store.next_display_number(kind).await?);
            if self.store.get_device(&candidate).await?.is_none() {
                return Ok(candidate);
            }
        }
        Err(ApiError::Internal(format!(
            "no free display id for {} devices",
            kind
        )))
    }

    // =========================================================================
    // Pairs and housekeeping
    // =========================================================================

    pub async fn deactivate_pair(&self, pair_id: Uuid) -> ApiResult<DevicePair> {
        let pair = self
            .store
            .deactivate_pair(pair_id, self.clock.now())
            .await?
            .ok_or_else(|| ApiError::not_found("pair", pair_id.to_string()))?;
        tracing::info!(pair_id = %pair_id, "Pair deactivated");
        Ok(pair)
    }

    /// Delete expired uncompleted bundles and unclaimed codes
    pub async fn sweep_expired(&self) -> ApiResult<u64> {
        let removed = self.store.delete_expired_pairing(self.clock.now()).await?;
        if removed > 0 {
            tracing::debug!(removed, "Expired pairing records removed");
        }
        Ok(removed)
    }

    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: std::time::Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = service.sweep_expired().await {
                            tracing::warn!(error = %e, "Pairing sweep failed");
                        }
                    }
                }
            }
            tracing::debug!("Pairing sweeper stopped");
        })
    }

    async fn draw_unused_code(&self) -> ApiResult<String> {
        let now = self.clock.now();
        for _ in 0..MAX_CODE_ATTEMPTS {
            let code = format!("{:06}", rand::thread_rng().gen_range(0..1_000_000u32));
            if !self.store.code_in_use(&code, now).await? {
                return Ok(code);
            }
            tracing::debug!(code = %code, "Pairing code collision, retrying");
        }
        Err(ApiError::Internal(
            "could not allocate an unused pairing code".to_string(),
        ))
    }

    fn claim_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.claim_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn release_claim_lock(&self, key: &str) {
        self.claim_locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }
}
