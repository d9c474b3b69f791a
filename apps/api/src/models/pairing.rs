//! Pairing codes, bundles and the device pairs they produce

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::device::DeviceKind;

/// Number of digits in every pairing code
pub const PAIRING_CODE_LEN: usize = 6;

/// Legacy single-device pairing code (`issued -> claimed | expired`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct PairingCode {
    pub code: String,
    pub kind: DeviceKind,
    pub expires_at: DateTime<Utc>,
    pub claimed: bool,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl PairingCode {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Two-device pairing bundle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct PairingBundle {
    pub id: Uuid,
    pub code: String,
    pub expires_at: DateTime<Utc>,
    pub vr_device_id: Option<String>,
    pub chair_device_id: Option<String>,
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    /// Existing pair to re-bind in place instead of creating a new one
    pub target_pair_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl PairingBundle {
    pub fn new(code: String, ttl: chrono::Duration, target_pair_id: Option<Uuid>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            code,
            expires_at: now + ttl,
            vr_device_id: None,
            chair_device_id: None,
            completed: false,
            completed_at: None,
            target_pair_id,
            created_at: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.completed && now >= self.expires_at
    }

    /// Live bundles reserve their code against reissue
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        !self.completed && now < self.expires_at
    }

    /// Device currently holding the slot for `kind`
    pub fn slot(&self, kind: DeviceKind) -> Option<&str> {
        match kind {
            DeviceKind::Vr => self.vr_device_id.as_deref(),
            DeviceKind::Chair => self.chair_device_id.as_deref(),
        }
    }

    pub fn set_slot(&mut self, kind: DeviceKind, device_id: impl Into<String>) {
        match kind {
            DeviceKind::Vr => self.vr_device_id = Some(device_id.into()),
            DeviceKind::Chair => self.chair_device_id = Some(device_id.into()),
        }
    }

    pub fn status(&self, now: DateTime<Utc>) -> BundleStatus {
        if self.completed {
            BundleStatus::Completed
        } else if now >= self.expires_at {
            BundleStatus::Expired
        } else if self.vr_device_id.is_some() || self.chair_device_id.is_some() {
            BundleStatus::PartiallyBound
        } else {
            BundleStatus::Issued
        }
    }
}

/// Bundle lifecycle, derived from the stored fields and the clock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleStatus {
    Issued,
    PartiallyBound,
    Completed,
    Expired,
}

/// Returned from every bundle claim
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleState {
    pub code: String,
    pub status: BundleStatus,
    pub expires_at: DateTime<Utc>,
    pub vr_device_id: Option<String>,
    pub chair_device_id: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    /// The pair created or rebound when the bundle completed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pair: Option<DevicePair>,
}

impl BundleState {
    pub fn from_bundle(bundle: &PairingBundle, pair: Option<DevicePair>, now: DateTime<Utc>) -> Self {
        Self {
            code: bundle.code.clone(),
            status: bundle.status(now),
            expires_at: bundle.expires_at,
            vr_device_id: bundle.vr_device_id.clone(),
            chair_device_id: bundle.chair_device_id.clone(),
            completed_at: bundle.completed_at,
            pair,
        }
    }
}

/// Code handed back to the operator on issue
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedCode {
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

/// Durable binding between one VR unit and one chair unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct DevicePair {
    pub id: Uuid,
    pub name: String,
    pub vr_device_id: String,
    pub chair_device_id: String,
    pub is_active: bool,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DevicePair {
    pub fn new(vr_device_id: impl Into<String>, chair_device_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        let vr_device_id = vr_device_id.into();
        let chair_device_id = chair_device_id.into();
        Self {
            id: Uuid::new_v4(),
            name: default_pair_name(&vr_device_id, &chair_device_id),
            vr_device_id,
            chair_device_id,
            is_active: true,
            notes: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.vr_device_id == device_id || self.chair_device_id == device_id
    }
}

pub fn default_pair_name(vr_device_id: &str, chair_device_id: &str) -> String {
    format!("{} + {}", vr_device_id, chair_device_id)
}

/// Validate the shape of a submitted code
pub fn is_well_formed_code(code: &str) -> bool {
    code.len() == PAIRING_CODE_LEN && code.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(now: DateTime<Utc>) -> PairingBundle {
        PairingBundle::new("483920".to_string(), chrono::Duration::seconds(120), None, now)
    }

    #[test]
    fn test_bundle_status_progression() {
        let now = Utc::now();
        let mut b = bundle(now);
        assert_eq!(b.status(now), BundleStatus::Issued);

        b.set_slot(DeviceKind::Vr, "VR_#001");
        assert_eq!(b.status(now), BundleStatus::PartiallyBound);
        assert_eq!(b.slot(DeviceKind::Vr), Some("VR_#001"));
        assert_eq!(b.slot(DeviceKind::Chair), None);

        b.completed = true;
        // completion wins over the clock
        assert_eq!(
            b.status(now + chrono::Duration::hours(1)),
            BundleStatus::Completed
        );
    }

    #[test]
    fn test_bundle_expiry_boundary() {
        let now = Utc::now();
        let b = bundle(now);
        assert!(b.is_live(now + chrono::Duration::seconds(119)));
        assert!(b.is_expired(now + chrono::Duration::seconds(120)));
        assert_eq!(
            b.status(now + chrono::Duration::seconds(121)),
            BundleStatus::Expired
        );
    }

    #[test]
    fn test_code_shape() {
        assert!(is_well_formed_code("483920"));
        assert!(is_well_formed_code("000001"));
        assert!(!is_well_formed_code("48392"));
        assert!(!is_well_formed_code("48392a"));
    }

    #[test]
    fn test_pair_membership() {
        let pair = DevicePair::new("VR_#001", "CHAIR_#001", Utc::now());
        assert!(pair.is_active);
        assert!(pair.contains("VR_#001"));
        assert!(pair.contains("CHAIR_#001"));
        assert!(!pair.contains("VR_#002"));
        assert_eq!(pair.name, "VR_#001 + CHAIR_#001");
    }
}
