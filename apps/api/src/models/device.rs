//! Device models for the VR headset / motion chair fleet
//!
//! A device is conceptually eternal: re-announcing reuses the same display id,
//! and presence is derived in memory rather than stored here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use thiserror::Error;

/// Maximum length for device ids (matches database constraint)
pub const MAX_DEVICE_ID_LEN: usize = 128;
/// Maximum length for hardware ids (matches database constraint)
pub const MAX_HARDWARE_ID_LEN: usize = 128;
/// Maximum serialized size of the opaque metadata object
pub const MAX_METADATA_BYTES: usize = 8 * 1024;

/// Errors that can occur during device validation
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeviceValidationError {
    #[error("device_id cannot be empty")]
    EmptyDeviceId,
    #[error("device_id exceeds maximum length of {MAX_DEVICE_ID_LEN} (got {0})")]
    DeviceIdTooLong(usize),
    #[error("device_id contains invalid characters")]
    InvalidDeviceIdChars,
    #[error("hardware_id exceeds maximum length of {MAX_HARDWARE_ID_LEN} (got {0})")]
    HardwareIdTooLong(usize),
    #[error("metadata must be a JSON object")]
    MetadataNotObject,
    #[error("metadata exceeds {MAX_METADATA_BYTES} bytes")]
    MetadataTooLarge,
    #[error("invalid device kind '{0}', must be 'vr' or 'chair'")]
    InvalidKind(String),
}

/// Which half of a seat a device is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum DeviceKind {
    Vr,
    Chair,
}

impl DeviceKind {
    /// Prefix used for sequential display ids (`VR_#001`)
    pub fn display_prefix(&self) -> &'static str {
        match self {
            Self::Vr => "VR",
            Self::Chair => "CHAIR",
        }
    }

    /// Build the display id for the `n`th device of this kind
    pub fn display_id(&self, n: u32) -> String {
        format!("{}_#{:03}", self.display_prefix(), n)
    }

    /// Guess the kind from a display id such as `VR_#004` or `CHAIR-2`
    pub fn infer_from_device_id(device_id: &str) -> Option<Self> {
        let upper = device_id.to_ascii_uppercase();
        if upper.starts_with("VR") {
            Some(Self::Vr)
        } else if upper.starts_with("CHAIR") {
            Some(Self::Chair)
        } else {
            None
        }
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Vr => write!(f, "vr"),
            Self::Chair => write!(f, "chair"),
        }
    }
}

impl std::str::FromStr for DeviceKind {
    type Err = DeviceValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "vr" | "headset" => Ok(Self::Vr),
            "chair" => Ok(Self::Chair),
            other => Err(DeviceValidationError::InvalidKind(other.to_string())),
        }
    }
}

/// Device record from the durable store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub hardware_id: Option<String>,
    pub kind: DeviceKind,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    /// Advisory only; live presence comes from the tracker
    pub last_seen_at: Option<DateTime<Utc>>,
}

/// Data for creating or refreshing a device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertDevice {
    pub id: String,
    pub hardware_id: Option<String>,
    pub kind: DeviceKind,
    pub metadata: serde_json::Value,
}

impl UpsertDevice {
    pub fn new(id: impl Into<String>, kind: DeviceKind) -> Self {
        Self {
            id: id.into(),
            hardware_id: None,
            kind,
            metadata: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn with_hardware_id(mut self, hardware_id: Option<String>) -> Self {
        self.hardware_id = hardware_id.filter(|h| !h.is_empty());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Validate before touching the store
    pub fn validate(&self) -> Result<(), DeviceValidationError> {
        validate_device_id(&self.id)?;

        if let Some(hardware_id) = &self.hardware_id {
            if hardware_id.len() > MAX_HARDWARE_ID_LEN {
                return Err(DeviceValidationError::HardwareIdTooLong(hardware_id.len()));
            }
        }

        validate_metadata(&self.metadata)
    }

    /// Materialize into a fresh record (used by the in-memory store)
    pub fn into_device(self, now: DateTime<Utc>) -> Device {
        Device {
            id: self.id,
            hardware_id: self.hardware_id,
            kind: self.kind,
            metadata: self.metadata,
            created_at: now,
            last_seen_at: Some(now),
        }
    }
}

/// Validate a device id for use in topic names and URLs
///
/// Allows alphanumerics plus `-`, `_`, `#`, `.` and `:`; rejects anything that
/// could split or wildcard a pub/sub topic.
pub fn validate_device_id(device_id: &str) -> Result<(), DeviceValidationError> {
    if device_id.is_empty() {
        return Err(DeviceValidationError::EmptyDeviceId);
    }
    if device_id.len() > MAX_DEVICE_ID_LEN {
        return Err(DeviceValidationError::DeviceIdTooLong(device_id.len()));
    }
    if !device_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '#' | '.' | ':'))
    {
        return Err(DeviceValidationError::InvalidDeviceIdChars);
    }
    Ok(())
}

/// Metadata is an opaque, bounded JSON object
pub fn validate_metadata(metadata: &serde_json::Value) -> Result<(), DeviceValidationError> {
    match metadata {
        serde_json::Value::Object(_) => {}
        serde_json::Value::Null => return Ok(()),
        _ => return Err(DeviceValidationError::MetadataNotObject),
    }
    let size = serde_json::to_vec(metadata).map(|v| v.len()).unwrap_or(usize::MAX);
    if size > MAX_METADATA_BYTES {
        return Err(DeviceValidationError::MetadataTooLarge);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_id_format() {
        assert_eq!(DeviceKind::Vr.display_id(1), "VR_#001");
        assert_eq!(DeviceKind::Chair.display_id(42), "CHAIR_#042");
        assert_eq!(DeviceKind::Vr.display_id(1234), "VR_#1234");
    }

    #[test]
    fn test_infer_kind() {
        assert_eq!(DeviceKind::infer_from_device_id("VR_#001"), Some(DeviceKind::Vr));
        assert_eq!(
            DeviceKind::infer_from_device_id("chair-7"),
            Some(DeviceKind::Chair)
        );
        assert_eq!(DeviceKind::infer_from_device_id("tablet-1"), None);
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("VR".parse::<DeviceKind>().unwrap(), DeviceKind::Vr);
        assert_eq!("chair".parse::<DeviceKind>().unwrap(), DeviceKind::Chair);
        assert!(matches!(
            "sofa".parse::<DeviceKind>(),
            Err(DeviceValidationError::InvalidKind(_))
        ));
    }

    #[test]
    fn test_validate_device_id() {
        assert!(validate_device_id("VR_#001").is_ok());
        assert!(validate_device_id("chair-12.a:b").is_ok());
        assert_eq!(
            validate_device_id(""),
            Err(DeviceValidationError::EmptyDeviceId)
        );
        assert_eq!(
            validate_device_id("devices/+/heartbeat"),
            Err(DeviceValidationError::InvalidDeviceIdChars)
        );
        assert_eq!(
            validate_device_id("vr*"),
            Err(DeviceValidationError::InvalidDeviceIdChars)
        );

        let max = "a".repeat(MAX_DEVICE_ID_LEN);
        assert!(validate_device_id(&max).is_ok());
        let long = "a".repeat(MAX_DEVICE_ID_LEN + 1);
        assert!(matches!(
            validate_device_id(&long),
            Err(DeviceValidationError::DeviceIdTooLong(_))
        ));
    }

    #[test]
    fn test_upsert_validation() {
        let upsert = UpsertDevice::new("VR_#001", DeviceKind::Vr)
            .with_hardware_id(Some("hw-abc".to_string()))
            .with_metadata(serde_json::json!({ "firmware": "2.1" }));
        assert!(upsert.validate().is_ok());

        let bad = UpsertDevice::new("VR_#001", DeviceKind::Vr)
            .with_metadata(serde_json::json!(["not", "an", "object"]));
        assert_eq!(bad.validate(), Err(DeviceValidationError::MetadataNotObject));
    }

    #[test]
    fn test_empty_hardware_id_is_dropped() {
        let upsert =
            UpsertDevice::new("CHAIR_#002", DeviceKind::Chair).with_hardware_id(Some(String::new()));
        assert!(upsert.hardware_id.is_none());
    }
}
