//! Observer feed for admin dashboards
//!
//! `GET /ws/observe?token=...` streams presence edges, device events, session
//! updates and drift samples as JSON frames. Observers are read-only; frames
//! they send other than close are ignored.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Extension, Query,
    },
    response::Response,
};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::services::auth::AuthService;
use crate::services::presence::{DevicePresence, PresenceEvent, PresenceTracker};
use crate::services::telemetry::DriftSample;

use super::messages::ErrorPayload;

const OBSERVER_CAPACITY: usize = 1024;

/// Session state change pushed after every committed command
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpdate {
    pub session_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub participant_id: Option<Uuid>,
    pub command: String,
    pub status: String,
    pub position_ms: i64,
    pub command_seq: i64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unreachable: Vec<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObserverEvent {
    /// Sent once when an observer connects
    Snapshot { devices: Vec<DevicePresence> },
    Presence(PresenceEvent),
    #[serde(rename_all = "camelCase")]
    DeviceEvent {
        device_id: String,
        payload: serde_json::Value,
    },
    Session(SessionUpdate),
    Drift(DriftSample),
    Error(ErrorPayload),
}

/// Fan-out point for observer sockets
#[derive(Clone)]
pub struct ObserverHub {
    sender: broadcast::Sender<ObserverEvent>,
}

impl Default for ObserverHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ObserverHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(OBSERVER_CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, event: ObserverEvent) {
        // no observers connected is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ObserverEvent> {
        self.sender.subscribe()
    }

    pub fn observer_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Forward presence edges until shutdown
    pub fn spawn_presence_relay(
        &self,
        presence: &PresenceTracker,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let hub = self.clone();
        let mut events = presence.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(event) => hub.publish(ObserverEvent::Presence(event)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Observer relay lagged behind presence events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct ObserveQuery {
    /// JWT access token; browsers cannot set headers on a socket upgrade
    token: String,
}

pub async fn observe_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ObserveQuery>,
    Extension(auth_service): Extension<AuthService>,
    Extension(hub): Extension<ObserverHub>,
    Extension(presence): Extension<Arc<PresenceTracker>>,
) -> Response {
    let claims = match auth_service.verify_access_token(&params.token) {
        Ok(claims) => claims,
        Err(e) => {
            tracing::warn!(error = %e, "Observer socket auth failed");
            return ws.on_upgrade(|mut socket| async move {
                let frame = ObserverEvent::Error(ErrorPayload::new("AUTH_FAILED", e.to_string()));
                if let Ok(json) = serde_json::to_string(&frame) {
                    let _ = socket.send(Message::Text(json)).await;
                }
                let _ = socket.close().await;
            });
        }
    };

    tracing::info!(subject = %claims.sub, "Observer connected");
    let subject = claims.sub;
    ws.on_upgrade(move |socket| handle_observer(socket, subject, hub, presence))
}

async fn handle_observer(
    socket: WebSocket,
    subject: String,
    hub: ObserverHub,
    presence: Arc<PresenceTracker>,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let mut events = hub.subscribe();

    let snapshot = ObserverEvent::Snapshot {
        devices: presence.snapshot(),
    };
    if let Ok(json) = serde_json::to_string(&snapshot) {
        if ws_sender.send(Message::Text(json)).await.is_err() {
            return;
        }
    }

    let subject_send = subject.clone();
    let mut send_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => {
                        if ws_sender.send(Message::Text(json)).await.is_err() {
                            tracing::debug!(subject = %subject_send, "Observer send failed");
                            break;
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "Failed to serialize observer event"),
                },
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(subject = %subject_send, lagged = n, "Observer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = ws_receiver.next().await {
            match result {
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    tracing::info!(subject = %subject, "Observer disconnected");
}
