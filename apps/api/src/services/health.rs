//! Health checks for the coordinator's dependencies
//!
//! - Durable store (Postgres or in-memory)
//! - Device broker (Redis pub/sub, or the in-memory fallback)
//! - Fleet summary from the presence view (informational)

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::repositories::SharedStore;
use crate::services::presence::PresenceTracker;
use crate::transport::connection::ConnectionRegistry;
use crate::transport::pubsub::MessageBus;

/// Upper bound on a single dependency check
const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Status of an individual dependency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Healthy,
    Unhealthy,
    /// Running without the dependency, e.g. the broker fell back to memory
    Degraded,
}

/// Result of a single dependency check
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub name: &'static str,
    pub status: ServiceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ServiceHealth {
    pub fn healthy(name: &'static str, response_time: Duration) -> Self {
        Self {
            name,
            status: ServiceStatus::Healthy,
            response_time_ms: Some(response_time.as_millis() as u64),
            error: None,
            details: None,
        }
    }

    pub fn unhealthy(name: &'static str, error: impl Into<String>) -> Self {
        Self {
            name,
            status: ServiceStatus::Unhealthy,
            response_time_ms: None,
            error: Some(error.into()),
            details: None,
        }
    }

    pub fn degraded(name: &'static str, reason: impl Into<String>) -> Self {
        Self {
            name,
            status: ServiceStatus::Degraded,
            response_time_ms: None,
            error: None,
            details: Some(serde_json::json!({ "reason": reason.into() })),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Aggregated health check response
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResponse {
    /// Healthy unless some dependency is unhealthy; degraded still serves
    pub status: ServiceStatus,
    pub services: Vec<ServiceHealth>,
    pub total_time_ms: u64,
    pub version: &'static str,
}

impl HealthCheckResponse {
    pub fn new(services: Vec<ServiceHealth>, total_time: Duration) -> Self {
        let status = if services.iter().any(|s| s.status == ServiceStatus::Unhealthy) {
            ServiceStatus::Unhealthy
        } else {
            ServiceStatus::Healthy
        };

        Self {
            status,
            services,
            total_time_ms: total_time.as_millis() as u64,
            version: env!("CARGO_PKG_VERSION"),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == ServiceStatus::Healthy
    }
}

pub struct HealthService {
    store: SharedStore,
    bus: MessageBus,
    presence: Arc<PresenceTracker>,
    connections: ConnectionRegistry,
}

impl HealthService {
    pub fn new(
        store: SharedStore,
        bus: MessageBus,
        presence: Arc<PresenceTracker>,
        connections: ConnectionRegistry,
    ) -> Self {
        Self {
            store,
            bus,
            presence,
            connections,
        }
    }

    pub async fn check_store(&self) -> ServiceHealth {
        let start = Instant::now();
        match tokio::time::timeout(CHECK_TIMEOUT, self.store.ping()).await {
            Ok(Ok(())) => ServiceHealth::healthy("store", start.elapsed()),
            Ok(Err(e)) => ServiceHealth::unhealthy("store", format!("Ping failed: {}", e)),
            Err(_) => ServiceHealth::unhealthy("store", "Ping timed out"),
        }
    }

    pub fn check_broker(&self) -> ServiceHealth {
        if self.bus.is_redis_backed() {
            ServiceHealth::healthy("broker", Duration::ZERO)
                .with_details(serde_json::json!({ "backend": "redis" }))
        } else {
            ServiceHealth::degraded("broker", "in-memory pub/sub, single instance only")
        }
    }

    pub fn fleet_summary(&self) -> ServiceHealth {
        let devices = self.presence.snapshot();
        let online = devices.iter().filter(|d| d.online).count();
        ServiceHealth::healthy("fleet", Duration::ZERO).with_details(serde_json::json!({
            "known": devices.len(),
            "online": online,
            "bridgeConnections": self.connections.connection_count(),
        }))
    }

    pub async fn check_all(&self) -> HealthCheckResponse {
        let start = Instant::now();
        let store = self.check_store().await;
        let services = vec![store, self.check_broker(), self.fleet_summary()];
        HealthCheckResponse::new(services, start.elapsed())
    }
}
