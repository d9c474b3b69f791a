//! Wire payloads for device topics and the bridge socket
//!
//! Everything is JSON with camelCase keys. Inbound payloads are lenient:
//! unknown fields are kept or ignored, never rejected.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::DeviceKind;

// =============================================================================
// Device -> Service payloads
// =============================================================================

/// Body of `devices/{id}/heartbeat`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub kind: Option<DeviceKind>,
    pub hardware_id: Option<String>,
    /// Battery, firmware and other telemetry, kept opaque
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Body of `devices/{id}/status`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPayload {
    pub status: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub kind: Option<DeviceKind>,
}

impl StatusPayload {
    /// Last-will or explicit disconnect
    pub fn is_offline(&self) -> bool {
        matches!(
            self.status.to_ascii_lowercase().as_str(),
            "offline" | "disconnected" | "shutdown"
        )
    }
}

/// Body of `devices/discovery/announce`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnouncePayload {
    pub device_id: String,
    pub kind: DeviceKind,
    #[serde(default)]
    pub hardware_id: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Body of `devices/{id}/progress`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressPayload {
    pub session_id: Uuid,
    pub participant_id: Uuid,
    pub position_ms: i64,
    #[serde(default)]
    pub device_clock_ms: Option<i64>,
    /// Overrides the side inferred from the reporting device
    #[serde(default)]
    pub side: Option<DeviceKind>,
}

// =============================================================================
// Service -> Device payloads
// =============================================================================

/// Outbound command; always carries absolute state so re-delivery converges
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandMessage {
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub participant_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_ms: Option<i64>,
    pub command_seq: i64,
    pub issued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub journey_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

impl CommandMessage {
    /// Operator-posted command outside any session
    pub fn adhoc(command: impl Into<String>, payload: serde_json::Value, now: DateTime<Utc>) -> Self {
        Self {
            command: command.into(),
            session_id: None,
            participant_id: None,
            status: None,
            position_ms: None,
            command_seq: 0,
            issued_at: now,
            journey_ids: Vec::new(),
            payload,
        }
    }
}

// =============================================================================
// Bridge socket frames
// =============================================================================

/// Frames a device sends over `/ws/devices`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeInbound {
    /// Bind this connection to a device id
    #[serde(rename_all = "camelCase")]
    Identify {
        device_id: String,
        #[serde(default)]
        kind: Option<DeviceKind>,
        #[serde(default)]
        hardware_id: Option<String>,
        #[serde(default)]
        metadata: serde_json::Value,
    },
    /// Same topic/payload a broker client would publish
    Publish {
        topic: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
    Ping,
}

/// Frames the service sends over `/ws/devices`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeOutbound {
    #[serde(rename_all = "camelCase")]
    Identified { device_id: String, server_time: i64 },
    Command {
        topic: String,
        command: CommandMessage,
    },
    Error(ErrorPayload),
    #[serde(rename_all = "camelCase")]
    Pong { server_time: i64 },
}

/// Payload for Error frames
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn invalid_message(message: impl Into<String>) -> Self {
        Self::new("INVALID_MESSAGE", message)
    }

    pub fn not_identified() -> Self {
        Self::new("NOT_IDENTIFIED", "Send identify before publishing")
    }

    pub fn already_bound(device_id: &str) -> Self {
        Self::new(
            "ALREADY_BOUND",
            format!("Connection is already bound to {}", device_id),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_keeps_unknown_fields() {
        let payload: HeartbeatPayload = serde_json::from_value(serde_json::json!({
            "kind": "chair",
            "battery": 87,
        }))
        .unwrap();
        assert_eq!(payload.kind, Some(DeviceKind::Chair));
        assert_eq!(payload.extra.get("battery"), Some(&serde_json::json!(87)));
    }

    #[test]
    fn test_empty_heartbeat_is_valid() {
        let payload: HeartbeatPayload = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(payload.kind.is_none());
    }

    #[test]
    fn test_status_offline_detection() {
        let status: StatusPayload =
            serde_json::from_value(serde_json::json!({ "status": "OFFLINE" })).unwrap();
        assert!(status.is_offline());
        let status: StatusPayload =
            serde_json::from_value(serde_json::json!({ "status": "online" })).unwrap();
        assert!(!status.is_offline());
    }

    #[test]
    fn test_bridge_frames() {
        let frame: BridgeInbound = serde_json::from_str(
            r#"{"type":"identify","deviceId":"VR_#001","kind":"vr"}"#,
        )
        .unwrap();
        assert!(matches!(
            frame,
            BridgeInbound::Identify { ref device_id, kind: Some(DeviceKind::Vr), .. } if device_id == "VR_#001"
        ));

        let frame: BridgeInbound = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(frame, BridgeInbound::Ping));

        let out = serde_json::to_value(BridgeOutbound::Pong { server_time: 5 }).unwrap();
        assert_eq!(out, serde_json::json!({ "type": "pong", "serverTime": 5 }));
    }

    #[test]
    fn test_command_message_shape() {
        let now = Utc::now();
        let msg = CommandMessage {
            command: "seek".into(),
            session_id: Some(Uuid::nil()),
            participant_id: None,
            status: Some("running".into()),
            position_ms: Some(42_000),
            command_seq: 7,
            issued_at: now,
            journey_ids: vec![],
            payload: serde_json::Value::Null,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["positionMs"], 42_000);
        assert_eq!(value["commandSeq"], 7);
        assert!(value.get("participantId").is_none());
        assert!(value.get("payload").is_none());

        let back: CommandMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back, msg);
    }
}
