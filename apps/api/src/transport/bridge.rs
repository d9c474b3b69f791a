//! Device bridge socket (`GET /ws/devices`)
//!
//! For devices that cannot reach the broker. After an `identify` frame the
//! connection speaks for one device: its `publish` frames are routed exactly
//! like broker traffic, and commands queued for the device are pushed down
//! the socket. Closing the socket takes the device offline unless a newer
//! connection has already taken it over.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Extension,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::models::{validate_device_id, DeviceKind};
use crate::services::clock::SharedClock;
use crate::services::commands::CommandDispatcher;
use crate::services::presence::{PresenceReason, PresenceTracker};

use super::connection::{BindError, ConnectionId, ConnectionRegistry};
use super::inbound::{InboundRouter, TransportKind};
use super::messages::{BridgeInbound, BridgeOutbound, ErrorPayload, HeartbeatPayload};
use super::topics::Topic;

/// Everything a bridge socket task needs
#[derive(Clone)]
pub struct BridgeContext {
    pub connections: ConnectionRegistry,
    pub presence: Arc<PresenceTracker>,
    pub commands: Arc<CommandDispatcher>,
    pub router: Arc<InboundRouter>,
    pub clock: SharedClock,
}

pub async fn device_bridge_handler(
    ws: WebSocketUpgrade,
    Extension(ctx): Extension<BridgeContext>,
) -> Response {
    ws.on_upgrade(move |socket| handle_bridge(socket, ctx))
}

async fn handle_bridge(socket: WebSocket, ctx: BridgeContext) {
    let (tx, mut rx) = mpsc::unbounded_channel::<BridgeOutbound>();
    let connection_id = ctx.connections.register(tx);
    let (mut ws_sender, mut ws_receiver) = socket.split();

    tracing::debug!(connection_id = %connection_id, "Bridge socket opened");

    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match serde_json::to_string(&frame) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        tracing::debug!(connection_id = %connection_id, "Bridge send failed");
                        break;
                    }
                }
                Err(e) => tracing::error!(error = %e, "Failed to serialize bridge frame"),
            }
        }
    });

    let recv_ctx = ctx.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = ws_receiver.next().await {
            match result {
                Ok(Message::Text(text)) => {
                    recv_ctx.connections.touch(connection_id);
                    match serde_json::from_str::<BridgeInbound>(&text) {
                        Ok(frame) => handle_frame(&recv_ctx, connection_id, frame).await,
                        Err(e) => {
                            tracing::debug!(
                                connection_id = %connection_id,
                                error = %e,
                                "Failed to parse bridge frame"
                            );
                            recv_ctx.connections.send(
                                connection_id,
                                BridgeOutbound::Error(ErrorPayload::invalid_message(e.to_string())),
                            );
                        }
                    }
                }
                Ok(Message::Binary(_)) => {
                    tracing::debug!(connection_id = %connection_id, "Ignoring binary bridge frame");
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                    recv_ctx.connections.touch(connection_id);
                }
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    tracing::debug!(connection_id = %connection_id, error = %e, "Bridge socket error");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    if let Some(device_id) = ctx.connections.unbind(connection_id) {
        ctx.presence
            .force_offline(&device_id, PresenceReason::Disconnect);
        tracing::info!(device_id = %device_id, "Bridge device disconnected");
    } else {
        tracing::debug!(connection_id = %connection_id, "Bridge socket closed");
    }
}

async fn handle_frame(ctx: &BridgeContext, connection_id: ConnectionId, frame: BridgeInbound) {
    match frame {
        BridgeInbound::Identify {
            device_id,
            kind,
            hardware_id,
            metadata,
        } => identify(ctx, connection_id, device_id, kind, hardware_id, metadata).await,
        BridgeInbound::Publish { topic, payload } => {
            let Some(device_id) = ctx.connections.device_for(connection_id) else {
                ctx.connections
                    .send(connection_id, BridgeOutbound::Error(ErrorPayload::not_identified()));
                return;
            };
            if !publishes_as(&topic, &device_id) {
                ctx.connections.send(
                    connection_id,
                    BridgeOutbound::Error(ErrorPayload::new(
                        "FORBIDDEN_TOPIC",
                        format!("{} may not publish on {}", device_id, topic),
                    )),
                );
                return;
            }
            mark_seen(ctx, &device_id);
            let message = ctx.router.message(TransportKind::Bridge, topic, payload);
            ctx.router.route(message).await;
        }
        BridgeInbound::Ping => {
            if let Some(device_id) = ctx.connections.device_for(connection_id) {
                mark_seen(ctx, &device_id);
            }
            ctx.connections.send(
                connection_id,
                BridgeOutbound::Pong {
                    server_time: ctx.clock.now().timestamp_millis(),
                },
            );
        }
    }
}

async fn identify(
    ctx: &BridgeContext,
    connection_id: ConnectionId,
    device_id: String,
    kind: Option<DeviceKind>,
    hardware_id: Option<String>,
    metadata: serde_json::Value,
) {
    if let Err(e) = validate_device_id(&device_id) {
        ctx.connections.send(
            connection_id,
            BridgeOutbound::Error(ErrorPayload::new("INVALID_DEVICE_ID", e.to_string())),
        );
        return;
    }

    match ctx.connections.bind(connection_id, &device_id) {
        Ok(Some(displaced)) => {
            ctx.connections.send(
                displaced,
                BridgeOutbound::Error(ErrorPayload::new(
                    "REPLACED",
                    format!("{} connected from another socket", device_id),
                )),
            );
        }
        Ok(None) => {}
        Err(BindError::AlreadyBound(bound)) => {
            ctx.connections
                .send(connection_id, BridgeOutbound::Error(ErrorPayload::already_bound(&bound)));
            return;
        }
        Err(BindError::UnknownConnection(_)) => return,
    }

    // same registration path as a first heartbeat
    ctx.presence
        .record_heartbeat(
            &device_id,
            HeartbeatPayload {
                kind,
                hardware_id: hardware_id.clone(),
                extra: Default::default(),
            },
        )
        .await;
    let Some(resolved) = ctx.presence.known_kind(&device_id) else {
        ctx.connections.release(connection_id);
        ctx.connections.send(
            connection_id,
            BridgeOutbound::Error(ErrorPayload::new(
                "UNKNOWN_KIND",
                "Device kind unknown; send kind with identify",
            )),
        );
        return;
    };
    if metadata.is_object() {
        if let Err(e) = ctx
            .presence
            .upsert_device(&device_id, resolved, hardware_id, metadata)
            .await
        {
            tracing::warn!(device_id = %device_id, error = %e, "Bridge identify metadata rejected");
        }
    }
    ctx.presence.record_bridge(&device_id, resolved);

    tracing::info!(
        device_id = %device_id,
        connection_id = %connection_id,
        kind = %resolved,
        "Bridge device identified"
    );
    ctx.connections.send(
        connection_id,
        BridgeOutbound::Identified {
            device_id: device_id.clone(),
            server_time: ctx.clock.now().timestamp_millis(),
        },
    );
    let flushed = ctx.commands.flush_to_bridge(&device_id);
    if flushed > 0 {
        tracing::debug!(device_id = %device_id, flushed, "Delivered queued commands");
    }
}

fn mark_seen(ctx: &BridgeContext, device_id: &str) {
    if let Some(kind) = ctx.presence.known_kind(device_id) {
        ctx.presence.record_bridge(device_id, kind);
    }
}

/// Whether an identified device may publish on `topic`
fn publishes_as(topic: &str, device_id: &str) -> bool {
    match Topic::parse(topic) {
        Some(Topic::Announce) => true,
        Some(Topic::Heartbeat { device_id: d })
        | Some(Topic::Status { device_id: d })
        | Some(Topic::Events { device_id: d })
        | Some(Topic::Progress { device_id: d }) => d == device_id,
        _ => false,
    }
}
