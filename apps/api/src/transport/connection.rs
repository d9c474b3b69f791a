//! Bridge-socket connection registry
//!
//! Maps socket connections to the device each one speaks for. The registry
//! only tracks bindings; deciding whether a released device is offline is
//! left to the presence tracker.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::messages::BridgeOutbound;

pub type ConnectionId = Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BindError {
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
    #[error("connection already bound to {0}")]
    AlreadyBound(String),
}

/// Handle for sending frames to one socket
#[derive(Debug)]
pub struct ConnectionHandle {
    pub sender: mpsc::UnboundedSender<BridgeOutbound>,
    pub device_id: Option<String>,
    /// When this connection was established (Unix timestamp ms)
    pub connected_at: i64,
    pub last_activity: Arc<AtomicI64>,
}

impl ConnectionHandle {
    fn new(sender: mpsc::UnboundedSender<BridgeOutbound>) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            sender,
            device_id: None,
            connected_at: now,
            last_activity: Arc::new(AtomicI64::new(now)),
        }
    }

    pub fn touch(&self) {
        self.last_activity
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// Thread-safe registry shared by every bridge socket task
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<DashMap<ConnectionId, ConnectionHandle>>,
    by_device: Arc<DashMap<String, ConnectionId>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly accepted socket
    pub fn register(&self, sender: mpsc::UnboundedSender<BridgeOutbound>) -> ConnectionId {
        let id = Uuid::new_v4();
        self.connections.insert(id, ConnectionHandle::new(sender));
        id
    }

    /// Bind a connection to a device; a newer connection for the same device
    /// takes over and the displaced connection id is returned
    pub fn bind(
        &self,
        connection_id: ConnectionId,
        device_id: &str,
    ) -> Result<Option<ConnectionId>, BindError> {
        {
            let mut handle = self
                .connections
                .get_mut(&connection_id)
                .ok_or(BindError::UnknownConnection(connection_id))?;
            match &handle.device_id {
                Some(bound) if bound != device_id => {
                    return Err(BindError::AlreadyBound(bound.clone()));
                }
                Some(_) => return Ok(None),
                None => handle.device_id = Some(device_id.to_string()),
            }
        }

        let displaced = self
            .by_device
            .insert(device_id.to_string(), connection_id)
            .filter(|previous| *previous != connection_id);

        if let Some(previous) = displaced {
            if let Some(mut old) = self.connections.get_mut(&previous) {
                old.device_id = None;
            }
            tracing::info!(
                device_id = %device_id,
                connection_id = %connection_id,
                displaced = %previous,
                "Device rebound to a newer connection"
            );
        }

        Ok(displaced)
    }

    /// Drop a connection; returns the device it was still speaking for
    pub fn unbind(&self, connection_id: ConnectionId) -> Option<String> {
        let (_, handle) = self.connections.remove(&connection_id)?;
        let device_id = handle.device_id?;
        self.by_device
            .remove_if(&device_id, |_, bound| *bound == connection_id)
            .map(|(device_id, _)| device_id)
    }

    /// Forget the device a live connection was bound to, keeping the socket
    pub fn release(&self, connection_id: ConnectionId) -> Option<String> {
        let device_id = self
            .connections
            .get_mut(&connection_id)
            .and_then(|mut handle| handle.device_id.take())?;
        self.by_device
            .remove_if(&device_id, |_, bound| *bound == connection_id);
        Some(device_id)
    }

    pub fn device_for(&self, connection_id: ConnectionId) -> Option<String> {
        self.connections
            .get(&connection_id)
            .and_then(|handle| handle.device_id.clone())
    }

    pub fn is_bound(&self, device_id: &str) -> bool {
        self.by_device.contains_key(device_id)
    }

    pub fn touch(&self, connection_id: ConnectionId) {
        if let Some(handle) = self.connections.get(&connection_id) {
            handle.touch();
        }
    }

    /// Push a frame to the socket bound to `device_id`
    pub fn send_to_device(&self, device_id: &str, frame: BridgeOutbound) -> bool {
        let Some(connection_id) = self.by_device.get(device_id).map(|entry| *entry) else {
            return false;
        };
        self.send(connection_id, frame)
    }

    pub fn send(&self, connection_id: ConnectionId, frame: BridgeOutbound) -> bool {
        match self.connections.get(&connection_id) {
            Some(handle) if handle.is_alive() => handle.sender.send(frame).is_ok(),
            _ => false,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn bound_count(&self) -> usize {
        self.by_device.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_conn() -> (
        ConnectionRegistry,
        ConnectionId,
        mpsc::UnboundedReceiver<BridgeOutbound>,
    ) {
        let registry = ConnectionRegistry::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let id = registry.register(tx);
        (registry, id, rx)
    }

    #[test]
    fn test_bind_and_unbind() {
        let (registry, conn, _rx) = registry_with_conn();
        assert_eq!(registry.bind(conn, "VR_#001"), Ok(None));
        assert!(registry.is_bound("VR_#001"));
        assert_eq!(registry.device_for(conn).as_deref(), Some("VR_#001"));

        assert_eq!(registry.unbind(conn).as_deref(), Some("VR_#001"));
        assert!(!registry.is_bound("VR_#001"));
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn test_rebind_same_device_is_noop() {
        let (registry, conn, _rx) = registry_with_conn();
        registry.bind(conn, "VR_#001").unwrap();
        assert_eq!(registry.bind(conn, "VR_#001"), Ok(None));
        assert_eq!(
            registry.bind(conn, "VR_#002"),
            Err(BindError::AlreadyBound("VR_#001".to_string()))
        );
    }

    #[test]
    fn test_newer_connection_takes_over() {
        let (registry, old, _rx1) = registry_with_conn();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let new = registry.register(tx2);

        registry.bind(old, "CHAIR_#001").unwrap();
        assert_eq!(registry.bind(new, "CHAIR_#001"), Ok(Some(old)));

        // the stale socket closing must not release the device
        assert_eq!(registry.unbind(old), None);
        assert!(registry.is_bound("CHAIR_#001"));

        assert!(registry.send_to_device("CHAIR_#001", BridgeOutbound::Pong { server_time: 1 }));
        assert!(matches!(rx2.try_recv(), Ok(BridgeOutbound::Pong { .. })));
    }

    #[test]
    fn test_send_to_unbound_device() {
        let registry = ConnectionRegistry::new();
        assert!(!registry.send_to_device("VR_#404", BridgeOutbound::Pong { server_time: 0 }));
    }
}
