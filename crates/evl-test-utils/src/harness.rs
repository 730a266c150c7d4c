use std::sync::Arc;

use evl_client::{ClientConfig, EventClient};
use evl_core::store::memory::MemoryEventStore;
use evl_server::{AggregateDefinition, Dispatcher, DispatcherConfig, SessionHost};
use evl_transport::loopback_pair;

/// A complete in-process deployment: memory store, bus, dispatcher, and one
/// connected client over a loopback transport.
///
/// Each harness is fully isolated; tests can spin up as many as they need.
pub struct LoopbackHarness {
    pub client: EventClient,
    pub store: Arc<MemoryEventStore>,
    host: SessionHost,
}

impl LoopbackHarness {
    /// Start a harness serving the given aggregates.
    pub fn start(aggregates: Vec<AggregateDefinition>) -> Self {
        Self::start_with(aggregates, ClientConfig::default(), DispatcherConfig::default())
    }

    pub fn start_with(
        aggregates: Vec<AggregateDefinition>,
        client_config: ClientConfig,
        dispatcher_config: DispatcherConfig,
    ) -> Self {
        let store = Arc::new(MemoryEventStore::new());
        let mut dispatcher =
            Dispatcher::new(store.clone()).with_config(dispatcher_config);
        for aggregate in aggregates {
            dispatcher = dispatcher.register(aggregate);
        }
        let host = SessionHost::new(store.clone(), dispatcher);

        let (client_side, server_side) = loopback_pair();
        host.spawn_session(Arc::new(server_side));
        let client = EventClient::with_config(Arc::new(client_side), client_config);

        LoopbackHarness {
            client,
            store,
            host,
        }
    }

    /// Open an additional independent client connection to the same server.
    pub fn connect_client(&self) -> EventClient {
        let (client_side, server_side) = loopback_pair();
        self.host.spawn_session(Arc::new(server_side));
        EventClient::connect(Arc::new(client_side))
    }

    pub fn host(&self) -> &SessionHost {
        &self.host
    }
}
