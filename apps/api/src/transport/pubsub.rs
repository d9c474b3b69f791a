//! Broker adapter for device topics
//!
//! Redis pub/sub for multi-instance deployments, with an in-memory fallback
//! for single instance mode when Redis is unavailable. Publishing is
//! fire-and-forget: failures are logged and the message is still delivered
//! to local subscribers.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, OnceCell};
use tokio_util::sync::CancellationToken;

use lockstep_shared_config::BrokerConfig;

use super::topics::INBOUND_PATTERN;

/// Channel capacity for broadcast channels
const BROADCAST_CAPACITY: usize = 1024;

/// One message on a topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    pub topic: String,
    pub payload: serde_json::Value,
}

/// Topic bus with Redis + in-memory fallback
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<MessageBusInner>,
}

enum MessageBusInner {
    /// Redis-backed pub/sub for multi-instance deployments
    Redis(RedisBus),
    /// In-memory pub/sub for single-instance mode
    InMemory(InMemoryBus),
}

impl MessageBus {
    /// Create a bus on an already-verified Redis client
    pub fn new_with_redis(
        client: redis::Client,
        config: &BrokerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(MessageBusInner::Redis(RedisBus::new(client, config, shutdown))),
        }
    }

    /// Create a new in-memory bus (single instance mode)
    pub fn new_in_memory() -> Self {
        Self {
            inner: Arc::new(MessageBusInner::InMemory(InMemoryBus::new())),
        }
    }

    /// Try to create with Redis, fall back to in-memory
    pub async fn try_with_redis(config: &BrokerConfig, shutdown: CancellationToken) -> Self {
        let url = config.connection_url();
        match redis::Client::open(url.as_str()) {
            Ok(client) => {
                let connect = tokio::time::timeout(
                    std::time::Duration::from_secs(config.connect_timeout_secs),
                    client.get_multiplexed_async_connection(),
                )
                .await;
                match connect {
                    Ok(Ok(mut conn)) => {
                        let pong: Result<String, _> =
                            redis::cmd("PING").query_async(&mut conn).await;
                        if pong.is_ok() {
                            tracing::info!("Redis pub/sub connected for device topics");
                            return Self::new_with_redis(client, config, shutdown);
                        }
                        tracing::warn!("Redis ping failed for pub/sub");
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(error = %e, "Redis pub/sub connection failed");
                    }
                    Err(_) => {
                        tracing::warn!(
                            timeout_secs = config.connect_timeout_secs,
                            "Redis pub/sub connection timed out"
                        );
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Redis client creation failed for pub/sub");
            }
        }

        tracing::warn!("Using in-memory pub/sub (single instance mode only)");
        Self::new_in_memory()
    }

    /// Publish a payload on a topic
    pub async fn publish(&self, topic: &str, payload: serde_json::Value) {
        let message = BusMessage {
            topic: topic.to_string(),
            payload,
        };
        match &*self.inner {
            MessageBusInner::Redis(redis) => redis.publish(message).await,
            MessageBusInner::InMemory(memory) => memory.publish(message),
        }
    }

    /// Serialize and publish; serialization failures are logged
    pub async fn publish_json<T: Serialize>(&self, topic: &str, value: &T) {
        match serde_json::to_value(value) {
            Ok(payload) => self.publish(topic, payload).await,
            Err(e) => tracing::error!(error = %e, topic, "Failed to serialize bus payload"),
        }
    }

    /// Receive every message seen by this instance
    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        match &*self.inner {
            MessageBusInner::Redis(redis) => redis.local_sender.subscribe(),
            MessageBusInner::InMemory(memory) => memory.sender.subscribe(),
        }
    }

    /// Check if we're using Redis (multi-instance capable)
    pub fn is_redis_backed(&self) -> bool {
        matches!(&*self.inner, MessageBusInner::Redis(_))
    }
}

/// Redis-backed implementation
struct RedisBus {
    client: redis::Client,
    publisher: OnceCell<redis::aio::MultiplexedConnection>,
    /// Local broadcast for redistribution to local subscribers
    local_sender: broadcast::Sender<BusMessage>,
}

impl RedisBus {
    fn new(client: redis::Client, config: &BrokerConfig, shutdown: CancellationToken) -> Self {
        let (local_sender, _) = broadcast::channel(BROADCAST_CAPACITY);

        let bus = Self {
            client,
            publisher: OnceCell::new(),
            local_sender,
        };

        bus.start_listener(
            config.max_reconnect_delay_secs,
            config.max_reconnect_attempts,
            shutdown,
        );

        bus
    }

    fn start_listener(
        &self,
        max_reconnect_delay_secs: u64,
        max_reconnect_attempts: u32,
        shutdown: CancellationToken,
    ) {
        let client = self.client.clone();
        let sender = self.local_sender.clone();

        tokio::spawn(async move {
            let mut attempts = 0u32;
            let mut delay_secs = 1u64;

            loop {
                let outcome = tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!("Redis pub/sub listener stopping");
                        return;
                    }
                    outcome = Self::run_listener(&client, &sender) => outcome,
                };

                match outcome {
                    Ok(()) => {
                        tracing::warn!("Redis pub/sub listener disconnected, reconnecting...");
                        attempts = 0;
                        delay_secs = 1;
                    }
                    Err(e) => {
                        attempts += 1;
                        if attempts >= max_reconnect_attempts {
                            tracing::error!(
                                "Redis pub/sub max reconnect attempts ({}) exceeded, giving up",
                                max_reconnect_attempts
                            );
                            break;
                        }
                        tracing::error!(
                            error = %e,
                            attempt = attempts,
                            delay_secs = delay_secs,
                            "Redis pub/sub listener error, reconnecting..."
                        );
                    }
                }

                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(tokio::time::Duration::from_secs(delay_secs)) => {}
                }
                delay_secs = (delay_secs * 2).min(max_reconnect_delay_secs);
            }
        });
    }

    async fn run_listener(
        client: &redis::Client,
        sender: &broadcast::Sender<BusMessage>,
    ) -> Result<(), redis::RedisError> {
        use futures_util::StreamExt;

        let conn = client.get_async_connection().await?;
        let mut pubsub = conn.into_pubsub();

        pubsub.psubscribe(INBOUND_PATTERN).await?;

        let mut stream = pubsub.on_message();

        while let Some(msg) = stream.next().await {
            let topic = msg.get_channel_name().to_string();
            let payload = match serde_json::from_slice::<serde_json::Value>(msg.get_payload_bytes()) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::debug!(error = %e, topic = %topic, "Dropping non-JSON payload");
                    continue;
                }
            };
            let _ = sender.send(BusMessage { topic, payload });
        }

        Ok(())
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.publisher
            .get_or_try_init(|| self.client.get_multiplexed_async_connection())
            .await
            .cloned()
    }

    async fn publish(&self, message: BusMessage) {
        let payload = match serde_json::to_string(&message.payload) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize bus message");
                return;
            }
        };

        match self.connection().await {
            Ok(mut conn) => {
                let result: Result<i64, _> = redis::cmd("PUBLISH")
                    .arg(&message.topic)
                    .arg(&payload)
                    .query_async(&mut conn)
                    .await;

                match result {
                    // broker echoes inbound topics back through the listener
                    Ok(_) if message.topic.starts_with("devices/") => {}
                    Ok(_) => {
                        let _ = self.local_sender.send(message);
                    }
                    Err(e) => {
                        tracing::error!(error = %e, topic = %message.topic, "Failed to publish to Redis");
                        let _ = self.local_sender.send(message);
                    }
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to get Redis connection for publish");
                let _ = self.local_sender.send(message);
            }
        }
    }
}

/// In-memory implementation for single-instance mode
struct InMemoryBus {
    sender: broadcast::Sender<BusMessage>,
}

impl InMemoryBus {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { sender }
    }

    fn publish(&self, message: BusMessage) {
        // Ignore send errors (no receivers)
        let _ = self.sender.send(message);
    }
}
