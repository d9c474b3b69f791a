//! Device and observer transports
//!
//! - `topics`: the topic hierarchy shared by every transport
//! - `messages`: wire payloads and bridge socket frames
//! - `pubsub`: broker adapter (Redis with in-memory fallback)
//! - `inbound`: single routing point for device-published traffic
//! - `connection`: bridge socket registry
//! - `bridge`: `/ws/devices` for devices without a broker
//! - `observer`: `/ws/observe` read-only feed for dashboards

pub mod bridge;
pub mod connection;
pub mod inbound;
pub mod messages;
pub mod observer;
pub mod pubsub;
pub mod topics;

pub use bridge::{device_bridge_handler, BridgeContext};
pub use connection::ConnectionRegistry;
pub use inbound::{InboundMessage, InboundRouter, TransportKind};
pub use messages::{BridgeInbound, BridgeOutbound, CommandMessage};
pub use observer::{observe_handler, ObserverEvent, ObserverHub};
pub use pubsub::MessageBus;
pub use topics::Topic;
