//! Inbound device traffic
//!
//! Devices publish the same topics whichever way they are connected: through
//! the broker, over the bridge socket, or by HTTP. Each arrival is wrapped in
//! an [`InboundMessage`] tagged with its transport and routed here to a single
//! place. Ingestion errors are logged and dropped; a device never gets an
//! error back for a malformed heartbeat.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::models::SessionLog;
use crate::repositories::SharedStore;
use crate::services::clock::SharedClock;
use crate::services::presence::PresenceTracker;
use crate::services::telemetry::{EntryOutcome, TelemetryService};

use super::messages::{AnnouncePayload, HeartbeatPayload, ProgressPayload, StatusPayload};
use super::observer::{ObserverEvent, ObserverHub};
use super::pubsub::MessageBus;
use super::topics::Topic;

/// How a message reached the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    PubSub,
    Polling,
    Bridge,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PubSub => write!(f, "pubsub"),
            Self::Polling => write!(f, "polling"),
            Self::Bridge => write!(f, "bridge"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub transport: TransportKind,
    pub topic: String,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

/// Shape of an `events` payload; anything else is kept in the audit details
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceEventPayload {
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    session_id: Option<Uuid>,
    #[serde(default)]
    participant_id: Option<Uuid>,
    #[serde(default)]
    position_ms: Option<i64>,
    #[serde(default)]
    error_code: Option<String>,
}

pub struct InboundRouter {
    presence: Arc<PresenceTracker>,
    telemetry: Arc<TelemetryService>,
    observers: ObserverHub,
    store: SharedStore,
    clock: SharedClock,
}

impl InboundRouter {
    pub fn new(
        presence: Arc<PresenceTracker>,
        telemetry: Arc<TelemetryService>,
        observers: ObserverHub,
        store: SharedStore,
        clock: SharedClock,
    ) -> Arc<Self> {
        Arc::new(Self {
            presence,
            telemetry,
            observers,
            store,
            clock,
        })
    }

    pub fn message(
        &self,
        transport: TransportKind,
        topic: impl Into<String>,
        payload: serde_json::Value,
    ) -> InboundMessage {
        InboundMessage {
            transport,
            topic: topic.into(),
            payload,
            received_at: self.clock.now(),
        }
    }

    /// Route one message, logging instead of returning failures
    pub async fn route(&self, message: InboundMessage) {
        let transport = message.transport;
        let topic = message.topic.clone();
        if let Err(e) = self.try_route(message).await {
            tracing::warn!(
                transport = %transport,
                topic = %topic,
                error = %e,
                "Dropped inbound message"
            );
        }
    }

    pub async fn try_route(&self, message: InboundMessage) -> ApiResult<()> {
        let topic = Topic::parse(&message.topic).ok_or_else(|| {
            ApiError::ValidationError(format!("unknown topic '{}'", message.topic))
        })?;

        match topic {
            Topic::Heartbeat { device_id } => {
                let payload: HeartbeatPayload = parse_or_default(message.payload)?;
                self.presence.record_heartbeat(&device_id, payload).await;
            }
            Topic::Status { device_id } => {
                let payload: StatusPayload = serde_json::from_value(message.payload)?;
                self.presence.record_status(&device_id, payload).await;
            }
            Topic::Announce => {
                let payload: AnnouncePayload = serde_json::from_value(message.payload)?;
                self.presence.record_announce(payload).await?;
            }
            Topic::Events { device_id } => {
                self.record_event(&device_id, message.payload, message.received_at)
                    .await?;
            }
            Topic::Progress { device_id } => {
                let payload: ProgressPayload = serde_json::from_value(message.payload)?;
                self.telemetry
                    .report_from_device(
                        &device_id,
                        payload.session_id,
                        payload.participant_id,
                        payload.position_ms,
                        payload.device_clock_ms,
                        payload.side,
                    )
                    .await?;
            }
            Topic::DeviceCommand { .. }
            | Topic::SessionCommand { .. }
            | Topic::ParticipantCommand { .. } => {
                // our own outbound traffic echoed back by the broker
                tracing::trace!(topic = %message.topic, "Ignoring outbound topic");
            }
        }
        Ok(())
    }

    async fn record_event(
        &self,
        device_id: &str,
        payload: serde_json::Value,
        received_at: DateTime<Utc>,
    ) -> ApiResult<()> {
        self.observers.publish(ObserverEvent::DeviceEvent {
            device_id: device_id.to_string(),
            payload: payload.clone(),
        });

        let event: DeviceEventPayload = parse_or_default(payload.clone()).unwrap_or_default();
        let Some(session_id) = event.session_id else {
            return Ok(());
        };
        if self.store.get_session(session_id).await?.is_none() {
            tracing::debug!(
                device_id = %device_id,
                session_id = %session_id,
                "Event for unknown session not logged"
            );
            return Ok(());
        }

        let mut log = SessionLog::new(
            session_id,
            event.event.unwrap_or_else(|| "device_event".to_string()),
            received_at,
        )
        .with_device(device_id)
        .with_details(payload);
        if let Some(position_ms) = event.position_ms {
            log = log.with_position(position_ms);
        }
        log.error_code = event.error_code.clone();
        self.store.append_log(&log).await?;

        if let (Some(participant_id), Some(code)) = (event.participant_id, event.error_code) {
            self.telemetry
                .close_entry(participant_id, EntryOutcome::Error(code))
                .await?;
        }
        Ok(())
    }

    /// Feed broker traffic into the router until shutdown
    pub fn spawn_bus_listener(
        self: &Arc<Self>,
        bus: &MessageBus,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let router = Arc::clone(self);
        let mut messages = bus.subscribe();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    message = messages.recv() => message,
                };
                match message {
                    Ok(message) => {
                        if !Topic::parse(&message.topic).is_some_and(|t| t.is_inbound()) {
                            continue;
                        }
                        let inbound =
                            router.message(TransportKind::PubSub, message.topic, message.payload);
                        router.route(inbound).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Inbound listener lagged behind the bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            tracing::debug!("Inbound bus listener stopped");
        })
    }
}

fn parse_or_default<T: DeserializeOwned + Default>(payload: serde_json::Value) -> ApiResult<T> {
    if payload.is_null() {
        return Ok(T::default());
    }
    Ok(serde_json::from_value(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Policy;
    use crate::models::{DeviceKind, SeatInfo, SessionParticipant};
    use crate::repositories::{MemoryStore, Pagination, Store};
    use crate::services::clock::{Clock, ManualClock};
    use serde_json::json;

    fn router() -> (Arc<MemoryStore>, Arc<PresenceTracker>, ObserverHub, Arc<InboundRouter>) {
        let clock = Arc::new(ManualClock::default());
        let store = MemoryStore::new();
        let policy = Policy::default();
        let presence =
            PresenceTracker::new(store.clone(), clock.clone(), policy.heartbeat_timeout());
        let observers = ObserverHub::new();
        let telemetry =
            TelemetryService::new(store.clone(), clock.clone(), observers.clone(), &policy);
        let router = InboundRouter::new(
            presence.clone(),
            telemetry,
            observers.clone(),
            store.clone(),
            clock,
        );
        (store, presence, observers, router)
    }

    #[tokio::test]
    async fn test_heartbeat_with_empty_payload() {
        let (_, presence, _, router) = router();
        let msg = router.message(TransportKind::Polling, "devices/VR_#001/heartbeat", json!(null));
        router.try_route(msg).await.unwrap();
        assert!(presence.is_online("VR_#001"));
    }

    #[tokio::test]
    async fn test_status_offline_is_last_will() {
        let (_, presence, _, router) = router();
        let hb = router.message(TransportKind::PubSub, "devices/CHAIR_#001/heartbeat", json!({}));
        router.try_route(hb).await.unwrap();
        let will = router.message(
            TransportKind::PubSub,
            "devices/CHAIR_#001/status",
            json!({ "status": "offline" }),
        );
        router.try_route(will).await.unwrap();
        assert!(!presence.is_online("CHAIR_#001"));
    }

    #[tokio::test]
    async fn test_announce_registers_device() {
        let (store, presence, _, router) = router();
        let msg = router.message(
            TransportKind::Bridge,
            "devices/discovery/announce",
            json!({ "deviceId": "HEADSET-A", "kind": "vr", "hardwareId": "hw-1" }),
        );
        router.try_route(msg).await.unwrap();
        let device = store.get_device("HEADSET-A").await.unwrap().unwrap();
        assert_eq!(device.kind, DeviceKind::Vr);
        assert!(presence.is_online("HEADSET-A"));
    }

    #[tokio::test]
    async fn test_events_reach_observers() {
        let (_, _, observers, router) = router();
        let mut rx = observers.subscribe();
        let msg = router.message(
            TransportKind::PubSub,
            "devices/VR_#001/events",
            json!({ "event": "battery_low" }),
        );
        router.try_route(msg).await.unwrap();
        assert!(matches!(
            rx.recv().await,
            Ok(ObserverEvent::DeviceEvent { ref device_id, .. }) if device_id == "VR_#001"
        ));
    }

    #[tokio::test]
    async fn test_event_for_unknown_session_is_not_logged() {
        let (store, _, _, router) = router();
        let session_id = Uuid::new_v4();
        let msg = router.message(
            TransportKind::PubSub,
            "devices/VR_#001/events",
            json!({ "event": "error", "sessionId": session_id }),
        );
        router.try_route(msg).await.unwrap();
        let logs = store.list_logs(session_id, Pagination::default()).await.unwrap();
        assert_eq!(logs.total, 0);
    }

    #[tokio::test]
    async fn test_unknown_topic_rejected() {
        let (_, _, _, router) = router();
        let msg = router.message(TransportKind::PubSub, "devices/VR_#001/unknown", json!({}));
        assert!(router.try_route(msg).await.is_err());
    }

    #[tokio::test]
    async fn test_bus_listener_routes_inbound_topics() {
        let (_, presence, _, router) = router();
        let bus = MessageBus::new_in_memory();
        let shutdown = CancellationToken::new();
        let handle = router.spawn_bus_listener(&bus, shutdown.clone());

        bus.publish("devices/VR_#007/heartbeat", json!({})).await;
        for _ in 0..50 {
            if presence.is_online("VR_#007") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(presence.is_online("VR_#007"));

        shutdown.cancel();
        handle.await.unwrap();
    }
    #[tokio::test]
    async fn test_bus_listener_survives_hostile_progress() {
        let (_, presence, _, router) = router();
        let session_id = Uuid::new_v4();
        let mut participant = SessionParticipant::new(
            session_id,
            None,
            "VR_#001",
            "CHAIR_#001",
            SeatInfo::default(),
            router.clock.now(),
        );
        participant.clock.start(router.clock.now());
        router.telemetry.track(std::slice::from_ref(&participant), None);

        let bus = MessageBus::new_in_memory();
        let shutdown = CancellationToken::new();
        let handle = router.spawn_bus_listener(&bus, shutdown.clone());

        bus.publish(
            "devices/VR_#001/progress",
            json!({
                "sessionId": session_id,
                "participantId": participant.id,
                "positionMs": i64::MIN,
                "deviceClockMs": i64::MIN,
            }),
        )
        .await;
        bus.publish("devices/VR_#009/heartbeat", json!({})).await;
        for _ in 0..50 {
            if presence.is_online("VR_#009") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(presence.is_online("VR_#009"));
        assert!(!handle.is_finished());

        shutdown.cancel();
        handle.await.unwrap();
    }
}
