//! Wires a connection's protocol state to the dispatcher and the event bus.
//!
//! Each session runs two cooperative halves: the commands half consumes the
//! connection's inbound command stream and answers every command with
//! exactly one result; the events half forwards bus traffic to the
//! connection, which filters by its subscription set.  The session ending
//! stops both; a publish failure never ends the session.

use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::connection::{ServerConnection, WireCommand};
use crate::dispatch::Dispatcher;
use evl_core::bus::{BusSubscription, EventBus};
use evl_core::command::{CommandError, CommandErrorKind, CommandResult};
use evl_core::store::EventStore;
use evl_transport::MessageTransport;

const DEFAULT_COMMAND_BUFFER: usize = 64;

/// Serve one client session until its transport ends.
pub async fn serve_session(
    transport: Arc<dyn MessageTransport>,
    dispatcher: Arc<Dispatcher>,
    events: BusSubscription,
    store: Arc<dyn EventStore>,
    command_buffer: usize,
) {
    let (connection, mut commands, _reader) =
        ServerConnection::start(transport, store, command_buffer);

    let events_connection = connection.clone();
    let events_task = tokio::spawn(async move {
        let mut events = events;
        while let Some(event) = events.next().await {
            if !events_connection.publish_event(&event).await {
                // Logged and swallowed: the commands half notices an actual
                // disconnect and ends the session.
                debug!(
                    stream_id = %event.stream_id,
                    event_number = event.event_number,
                    "event not delivered to connection"
                );
            }
        }
    });

    while let Some(command) = commands.recv().await {
        let result = dispatch_contained(&dispatcher, &command).await;
        connection.send_result(&command.command_id, &result).await;
    }

    events_task.abort();
    info!("session ended");
}

/// Dispatch inside its own task so a crashing handler is contained and
/// surfaced as a result instead of killing the session.
async fn dispatch_contained(dispatcher: &Arc<Dispatcher>, command: &WireCommand) -> CommandResult {
    let dispatcher = dispatcher.clone();
    let owned = command.clone();
    match tokio::spawn(async move { dispatcher.dispatch(&owned).await }).await {
        Ok(result) => result,
        Err(join_error) => {
            let reason = if join_error.is_panic() {
                "dispatch panicked"
            } else {
                "dispatch cancelled"
            };
            Err(CommandError::new(
                CommandErrorKind::Unknown,
                reason,
                &command.command_id,
                &command.name,
            ))
        }
    }
}

/// One server's worth of shared machinery: store, dispatcher, bus.
///
/// Construct once at startup, then hand every accepted transport to
/// [`spawn_session`](Self::spawn_session).
pub struct SessionHost {
    dispatcher: Arc<Dispatcher>,
    bus: Arc<EventBus>,
    store: Arc<dyn EventStore>,
    command_buffer: usize,
}

impl SessionHost {
    /// Wire the host; forks the bus pump off `store.subscribe_all()`.
    pub fn new(store: Arc<dyn EventStore>, dispatcher: Dispatcher) -> Self {
        let bus = Arc::new(EventBus::start(store.subscribe_all()));
        SessionHost {
            dispatcher: Arc::new(dispatcher),
            bus,
            store,
            command_buffer: DEFAULT_COMMAND_BUFFER,
        }
    }

    /// Override the per-connection inbound command channel capacity.
    pub fn with_command_buffer(mut self, command_buffer: usize) -> Self {
        self.command_buffer = command_buffer;
        self
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn store(&self) -> Arc<dyn EventStore> {
        self.store.clone()
    }

    /// Fork a session for one accepted transport.
    pub fn spawn_session(&self, transport: Arc<dyn MessageTransport>) -> JoinHandle<()> {
        let dispatcher = self.dispatcher.clone();
        let events = self.bus.subscribe(|_| true);
        let store = self.store.clone();
        let command_buffer = self.command_buffer;
        tokio::spawn(serve_session(
            transport,
            dispatcher,
            events,
            store,
            command_buffer,
        ))
    }

    /// Accept sessions until the listener closes.
    pub async fn serve(&self, mut listener: impl evl_transport::TransportListener) {
        while let Some(transport) = listener.accept().await {
            self.spawn_session(transport);
        }
    }
}
