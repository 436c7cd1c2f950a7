pub mod auth;
pub mod commands;
pub mod config;
pub mod error;
pub mod gateway;
pub mod models;
pub mod permissions;
pub mod routes;
pub mod service;

use std::sync::Arc;

use axum::Router;
use tower_http::trace::TraceLayer;

use commands::CommandRouter;
use config::Config;
use error::{RegistryError, StartupError};
use gateway::correlator::{BotApi, RequestCorrelator};
use gateway::dispatcher::{EventDispatcher, EventSubscriber};
use gateway::fanout::EventFanout;
use gateway::heartbeat::HeartbeatMonitor;
use gateway::registry::ConnectionRegistry;
use service::{ServiceRecord, ServiceRegistry};

/// Shared runtime state. Owns every registry; cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub connections: Arc<ConnectionRegistry>,
    pub services: Arc<ServiceRegistry>,
    pub correlator: Arc<RequestCorrelator>,
    pub router: Arc<CommandRouter>,
    pub dispatcher: Arc<EventDispatcher>,
    pub fanout: EventFanout,
}

impl AppState {
    pub fn new(config: Config, router: CommandRouter) -> Self {
        Self::with_subscribers(config, router, Vec::new())
    }

    pub fn with_subscribers(
        config: Config,
        router: CommandRouter,
        subscribers: Vec<Arc<dyn EventSubscriber>>,
    ) -> Self {
        let connections = Arc::new(ConnectionRegistry::new());
        let services = Arc::new(ServiceRegistry::new());
        let correlator = Arc::new(RequestCorrelator::new(connections.clone()));
        let router = Arc::new(router);
        let fanout = EventFanout::new();

        let dispatcher = subscribers.into_iter().fold(
            EventDispatcher::new(
                connections.clone(),
                services.clone(),
                correlator.clone(),
                router.clone(),
                fanout.clone(),
            ),
            EventDispatcher::subscribe,
        );

        Self {
            config: Arc::new(config),
            connections,
            services,
            correlator,
            router,
            dispatcher: Arc::new(dispatcher),
            fanout,
        }
    }

    /// Register the configured service and start its heartbeat monitor.
    pub fn start_service(&self) -> Result<Arc<ServiceRecord>, StartupError> {
        let service = self
            .services
            .insert(ServiceRecord::from_config(&self.config))
            .ok_or_else(|| RegistryError::Duplicate(self.config.service_id.clone()))?;
        // A service id reused after disposal accepts continuations again.
        self.router.waits().reopen_service(&service.service_id);

        HeartbeatMonitor::new(
            service.service_id.clone(),
            self.connections.clone(),
            self.config.heartbeat_timeout,
        )
        .spawn(service.shutdown_token());

        tracing::info!(
            service_id = %service.service_id,
            mode = ?self.config.mode,
            commands = self.router.command_names().count(),
            "service started"
        );
        Ok(service)
    }

    /// Tear a service down: stop its tasks, close its connections and
    /// release its waiters. Returns `false` if it was not running.
    pub fn dispose_service(&self, service_id: &str) -> bool {
        let Some(service) = self.services.remove(service_id) else {
            return false;
        };
        let connections = self.connections.connections_for(service_id);
        for record in &connections {
            self.connections.close(&record.connection_id);
            self.correlator.abandon_connection(&record.connection_id);
        }
        let waiters = self.router.waits().cancel_service(service_id);
        tracing::info!(
            service_id = %service.service_id,
            connections = connections.len(),
            waiters,
            "service disposed"
        );
        true
    }

    /// Typed call handle for one connection.
    pub fn bot(&self, connection_id: &str) -> BotApi {
        BotApi::new(self.correlator.clone(), connection_id)
    }

    /// Health route plus the WebSocket endpoint, with request tracing.
    pub fn http_router(&self) -> Router {
        Router::new()
            .merge(routes::router(&self.config.ws_path))
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }
}
