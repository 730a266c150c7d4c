//! Runnable broker: a WebSocket endpoint serving the session protocol over
//! a configured event store.
//!
//! The binary serves subscriptions out of the box; command handling is
//! supplied by the embedding application through
//! [`Broker::with_aggregate`].

pub mod config;
pub mod ws;

use std::path::Path;
use std::sync::Arc;

use axum::{Router, routing::get};

use evl_core::store::EventStore;
use evl_core::store::memory::MemoryEventStore;
use evl_core::store::sqlite::SqliteEventStore;
use evl_server::{AggregateDefinition, Dispatcher, DispatcherConfig, SessionHost};

pub use config::{
    BrokerConfig, ConfigError, DEFAULT_CONFIG_PATH, StoreBackend, load_config, parse_config,
};

/// Failures while assembling a broker from its config.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("store: {0}")]
    Store(#[from] evl_core::store::EventStoreError),
    #[error("config: {0}")]
    Config(#[from] ConfigError),
}

/// Shared per-process state behind the router.
#[derive(Clone)]
pub struct AppState {
    pub host: Arc<SessionHost>,
}

/// Builder wiring config + aggregates into a servable router.
pub struct Broker {
    config: BrokerConfig,
    aggregates: Vec<AggregateDefinition>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Broker {
            config,
            aggregates: Vec::new(),
        }
    }

    /// Register an aggregate with the dispatcher.
    pub fn with_aggregate(mut self, aggregate: AggregateDefinition) -> Self {
        self.aggregates.push(aggregate);
        self
    }

    /// Open the configured store and build the session host + router.
    pub fn build(self) -> Result<(AppState, Router), BrokerError> {
        let store: Arc<dyn EventStore> = match self.config.store.backend {
            StoreBackend::Memory => Arc::new(MemoryEventStore::new()),
            StoreBackend::Sqlite => {
                let path = self
                    .config
                    .store
                    .sqlite_path
                    .as_deref()
                    .expect("validated by config loading");
                Arc::new(SqliteEventStore::open(Path::new(path))?)
            }
        };

        let mut dispatcher = Dispatcher::new(store.clone()).with_config(DispatcherConfig {
            conflict_retries: self.config.dispatch.conflict_retries,
        });
        for aggregate in self.aggregates {
            dispatcher = dispatcher.register(aggregate);
        }

        let state = AppState {
            host: Arc::new(
                SessionHost::new(store, dispatcher)
                    .with_command_buffer(self.config.limits.command_buffer),
            ),
        };
        let router = build_router(state.clone());
        Ok((state, router))
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/v1/sessions", get(ws::ws_session_handler))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}
