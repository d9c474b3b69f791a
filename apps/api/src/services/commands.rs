//! Per-device command queue and dispatcher
//!
//! Every outbound device command goes through one queue per device. The push
//! paths (broker topic, bridge socket) and the polling path
//! (`GET /commands/{deviceId}`) all read from it, so a device that falls back
//! to polling sees the same commands it would have been pushed. Queues are
//! bounded; the oldest entry is dropped when a queue is full, which is safe
//! because every command carries absolute state.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};
use crate::models::validate_device_id;
use crate::transport::connection::ConnectionRegistry;
use crate::transport::messages::{BridgeOutbound, CommandMessage};
use crate::transport::pubsub::MessageBus;
use crate::transport::topics::Topic;

/// A command waiting for its device, with the topic it was published on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedCommand {
    pub topic: String,
    pub command: CommandMessage,
}

pub struct CommandDispatcher {
    queues: DashMap<String, VecDeque<QueuedCommand>>,
    capacity: usize,
    bus: MessageBus,
    connections: ConnectionRegistry,
}

impl CommandDispatcher {
    pub fn new(bus: MessageBus, connections: ConnectionRegistry, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            queues: DashMap::new(),
            capacity: capacity.max(1),
            bus,
            connections,
        })
    }

    /// Publish on a topic that is not addressed to a single device
    pub async fn broadcast(&self, topic: &str, command: &CommandMessage) {
        self.bus.publish_json(topic, command).await;
    }

    /// Queue, publish and push to a bridge socket if the device has one
    pub async fn dispatch(&self, device_id: &str, topic: String, command: CommandMessage) {
        self.bus.publish_json(&topic, &command).await;
        self.enqueue(device_id, QueuedCommand { topic, command });
        self.flush_to_bridge(device_id);
    }

    /// Operator-posted command for one device
    pub async fn post(
        &self,
        device_id: &str,
        command: &str,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> ApiResult<QueuedCommand> {
        validate_device_id(device_id)?;
        if command.is_empty() || command.contains(&['/', '*', '+', '#'][..]) {
            return Err(ApiError::ValidationError(format!(
                "invalid command name '{}'",
                command
            )));
        }

        let queued = QueuedCommand {
            topic: Topic::device_command(device_id, command),
            command: CommandMessage::adhoc(command, payload, now),
        };
        self.dispatch(device_id, queued.topic.clone(), queued.command.clone())
            .await;
        Ok(queued)
    }

    pub fn enqueue(&self, device_id: &str, queued: QueuedCommand) {
        let mut queue = self.queues.entry(device_id.to_string()).or_default();
        if queue.len() >= self.capacity {
            if let Some(dropped) = queue.pop_front() {
                tracing::debug!(
                    device_id = %device_id,
                    topic = %dropped.topic,
                    "Command queue full, dropping oldest"
                );
            }
        }
        queue.push_back(queued);
    }

    /// Take every pending command for a device, oldest first
    pub fn drain(&self, device_id: &str) -> Vec<QueuedCommand> {
        self.queues
            .remove(device_id)
            .map(|(_, queue)| queue.into_iter().collect())
            .unwrap_or_default()
    }

    pub fn pending(&self, device_id: &str) -> usize {
        self.queues.get(device_id).map(|q| q.len()).unwrap_or(0)
    }

    /// Push queued commands down the device's bridge socket, if bound
    pub fn flush_to_bridge(&self, device_id: &str) -> usize {
        if !self.connections.is_bound(device_id) {
            return 0;
        }
        let mut sent = 0;
        for queued in self.drain(device_id) {
            let frame = BridgeOutbound::Command {
                topic: queued.topic.clone(),
                command: queued.command.clone(),
            };
            if !self.connections.send_to_device(device_id, frame) {
                // socket went away mid-flush; keep it for the next poll
                self.enqueue(device_id, queued);
                continue;
            }
            sent += 1;
        }
        sent
    }
}
