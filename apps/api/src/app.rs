//! Service wiring
//!
//! Builds every service once from a [`Config`], a store, a bus and a clock,
//! and exposes the axum router and the background tasks. The binary and the
//! integration tests go through the same path.

use std::sync::Arc;

use axum::{extract::Extension, routing::get, Router};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::repositories::SharedStore;
use crate::routes::{
    commands_router, devices_router, health_router, pairing_router, sessions_router,
    CommandsState, DevicesState, HealthState, PairingState, SessionsState,
};
use crate::services::{
    AuthConfig, AuthService, CommandDispatcher, HealthService, PairingService, PresenceTracker,
    SessionOrchestrator, SharedClock, TelemetryService,
};
use crate::transport::{
    device_bridge_handler, observe_handler, BridgeContext, ConnectionRegistry, InboundRouter,
    MessageBus, ObserverHub,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: SharedStore,
    pub clock: SharedClock,
    pub bus: MessageBus,
    pub connections: ConnectionRegistry,
    pub observers: ObserverHub,
    pub auth: AuthService,
    pub presence: Arc<PresenceTracker>,
    pub pairing: Arc<PairingService>,
    pub commands: Arc<CommandDispatcher>,
    pub telemetry: Arc<TelemetryService>,
    pub orchestrator: Arc<SessionOrchestrator>,
    pub inbound: Arc<InboundRouter>,
    pub health: Arc<HealthService>,
}

impl AppState {
    pub fn new(config: Config, store: SharedStore, bus: MessageBus, clock: SharedClock) -> Self {
        let policy = config.policy.clone();
        let connections = ConnectionRegistry::new();
        let observers = ObserverHub::new();
        let auth = AuthService::new(AuthConfig::new(config.jwt_secret.clone()));

        let presence =
            PresenceTracker::new(store.clone(), clock.clone(), policy.heartbeat_timeout());
        let pairing =
            PairingService::new(store.clone(), clock.clone(), presence.clone(), &policy);
        let commands = CommandDispatcher::new(
            bus.clone(),
            connections.clone(),
            policy.command_queue_capacity,
        );
        let telemetry =
            TelemetryService::new(store.clone(), clock.clone(), observers.clone(), &policy);
        let orchestrator = SessionOrchestrator::new(
            store.clone(),
            clock.clone(),
            presence.clone(),
            commands.clone(),
            telemetry.clone(),
            observers.clone(),
        );
        let inbound = InboundRouter::new(
            presence.clone(),
            telemetry.clone(),
            observers.clone(),
            store.clone(),
            clock.clone(),
        );
        let health = Arc::new(HealthService::new(
            store.clone(),
            bus.clone(),
            presence.clone(),
            connections.clone(),
        ));

        Self {
            config: Arc::new(config),
            store,
            clock,
            bus,
            connections,
            observers,
            auth,
            presence,
            pairing,
            commands,
            telemetry,
            orchestrator,
            inbound,
            health,
        }
    }

    /// Full HTTP surface without CORS, which the binary adds from config
    pub fn router(&self) -> Router {
        let bridge = BridgeContext {
            connections: self.connections.clone(),
            presence: self.presence.clone(),
            commands: self.commands.clone(),
            router: self.inbound.clone(),
            clock: self.clock.clone(),
        };

        Router::new()
            .route("/", get(root))
            .nest("/health", health_router(HealthState::new(self.health.clone())))
            .nest(
                "/devices",
                devices_router(DevicesState {
                    store: self.store.clone(),
                    presence: self.presence.clone(),
                    inbound: self.inbound.clone(),
                }),
            )
            .nest(
                "/pairing",
                pairing_router(PairingState {
                    pairing: self.pairing.clone(),
                }),
            )
            .nest(
                "/sessions",
                sessions_router(SessionsState {
                    orchestrator: self.orchestrator.clone(),
                    telemetry: self.telemetry.clone(),
                }),
            )
            .nest(
                "/commands",
                commands_router(CommandsState {
                    commands: self.commands.clone(),
                    clock: self.clock.clone(),
                }),
            )
            .route("/ws/devices", get(device_bridge_handler))
            .route("/ws/observe", get(observe_handler))
            // Services as extensions for extractors and socket handlers
            .layer(Extension(bridge))
            .layer(Extension(self.observers.clone()))
            .layer(Extension(self.presence.clone()))
            .layer(Extension(self.auth.clone()))
            .layer(TraceLayer::new_for_http())
    }

    /// Start sweepers, relays and the broker listener; all stop on `shutdown`
    pub fn spawn_background(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let policy = &self.config.policy;
        vec![
            self.presence
                .spawn_sweeper(policy.presence_sweep_interval(), shutdown.clone()),
            self.presence.spawn_last_seen_writer(shutdown.clone()),
            self.pairing
                .spawn_sweeper(policy.pairing_sweep_interval(), shutdown.clone()),
            self.observers
                .spawn_presence_relay(&self.presence, shutdown.clone()),
            self.inbound.spawn_bus_listener(&self.bus, shutdown),
        ]
    }
}

async fn root() -> &'static str {
    "Lockstep - paired-seat playback coordinator"
}
