use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use evl_core::command::{Command, CommandError, CommandErrorKind, CommandResult};
use evl_core::types::{EventNumber, EventPayload, RecordedEvent, StreamId, StreamPosition};
use evl_protocol::{
    CommandBody, CommandResultBody, Frame, FrameBody, SubscribeBody, UnsubscribeBody,
    WirePosition, encode_frame,
};
use evl_transport::MessageTransport;

use crate::subscription::{Subscription, SubscriptionCleanup};

/// Client tuning knobs.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Hard deadline for each command, wall-clock from send.
    pub command_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            command_timeout: Duration::from_secs(10),
        }
    }
}

/// Failures of [`EventClient::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscribeError {
    #[error("transport disconnected")]
    Disconnected,
    /// At most one subscription per stream id per connection.
    #[error("already subscribed to {0}")]
    AlreadySubscribed(StreamId),
}

struct PendingCommand {
    command_name: String,
    sink: oneshot::Sender<CommandResult>,
}

pub(crate) struct SubscriptionEntry {
    pub(crate) token: u64,
    tx: mpsc::UnboundedSender<RecordedEvent>,
}

/// What a `correlationId` on a server frame refers to.
enum CorrelationTarget {
    Command(String),
    Subscription(StreamId),
}

#[derive(Default)]
struct ClientState {
    pending: HashMap<String, PendingCommand>,
    subscriptions: HashMap<StreamId, SubscriptionEntry>,
    correlation: HashMap<String, CorrelationTarget>,
    pings: HashMap<String, oneshot::Sender<()>>,
    disconnected: bool,
}

pub(crate) struct ClientShared {
    pub(crate) transport: Arc<dyn MessageTransport>,
    config: ClientConfig,
    state: Mutex<ClientState>,
    subscription_tokens: AtomicU64,
}

/// One protocol session over one transport connection.
///
/// Dropping the client aborts the router task and fails everything still
/// pending.
pub struct EventClient {
    shared: Arc<ClientShared>,
    router: JoinHandle<()>,
}

impl EventClient {
    /// Take ownership of a connected transport and start routing frames.
    pub fn connect(transport: Arc<dyn MessageTransport>) -> Self {
        EventClient::with_config(transport, ClientConfig::default())
    }

    pub fn with_config(transport: Arc<dyn MessageTransport>, config: ClientConfig) -> Self {
        let frames = transport.receive();
        let shared = Arc::new(ClientShared {
            transport,
            config,
            state: Mutex::new(ClientState::default()),
            subscription_tokens: AtomicU64::new(1),
        });
        let router_shared = shared.clone();
        let router = tokio::spawn(run_router(router_shared, frames));
        EventClient { shared, router }
    }

    /// Send a command and await its single terminal result.
    ///
    /// Resolves with the first of: a routed `command_result`, the deadline
    /// (default 10 s), or transport loss.  The deadline is authoritative:
    /// a result arriving later is dropped.
    pub async fn send_command(&self, command: Command) -> CommandResult {
        let command = if command.id.is_empty() {
            let id = uuid::Uuid::new_v4().to_string();
            command.with_id(id)
        } else {
            command
        };
        let timeout_ms = self.shared.config.command_timeout.as_millis() as u64;

        // A dead transport fails immediately, leaving no pending entry.
        if self.shared.transport.state().borrow().is_terminal() {
            return Err(CommandError::disconnected(&command.id, &command.name));
        }

        let (sink, completion) = oneshot::channel();
        {
            let mut state = self.shared.state.lock();
            if state.disconnected {
                return Err(CommandError::disconnected(&command.id, &command.name));
            }
            if state.pending.contains_key(&command.id) {
                return Err(CommandError::new(
                    CommandErrorKind::Protocol,
                    "command id already in flight on this connection",
                    &command.id,
                    &command.name,
                ));
            }
            state.pending.insert(
                command.id.clone(),
                PendingCommand {
                    command_name: command.name.clone(),
                    sink,
                },
            );
            state
                .correlation
                .insert(command.id.clone(), CorrelationTarget::Command(command.id.clone()));
        }
        // Removes the entry on every exit path that the router has not
        // already consumed, including caller cancellation.
        let _guard = PendingGuard {
            shared: self.shared.clone(),
            command_id: command.id.clone(),
        };

        let encoded = match encode_frame(&command_frame(&command)) {
            Ok(text) => text,
            Err(e) => {
                // Impossible for payloads the core constructs; a local bug.
                return Err(CommandError::new(
                    CommandErrorKind::Unknown,
                    format!("frame encoding failed: {e}"),
                    &command.id,
                    &command.name,
                ));
            }
        };
        if self.shared.transport.send(encoded).await.is_err() {
            return Err(CommandError::disconnected(&command.id, &command.name));
        }

        match tokio::time::timeout(self.shared.config.command_timeout, completion).await {
            Ok(Ok(result)) => result,
            // Sink dropped without a result: the session tore down.
            Ok(Err(_)) => Err(CommandError::disconnected(&command.id, &command.name)),
            Err(_elapsed) => Err(CommandError::timeout(&command.id, &command.name, timeout_ms)),
        }
    }

    /// Open a live subscription to `stream_id`.
    ///
    /// The returned stream yields events in commit order for that stream.
    /// Dropping it removes the registration and sends a best-effort
    /// `unsubscribe`.
    pub async fn subscribe(
        &self,
        stream_id: StreamId,
        from: Option<EventNumber>,
    ) -> Result<Subscription, SubscribeError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = self.shared.subscription_tokens.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::new(FrameBody::Subscribe(SubscribeBody {
            stream_id: stream_id.to_string(),
            from_position: from,
            include_metadata: None,
            batch_size: None,
        }));
        {
            let mut state = self.shared.state.lock();
            if state.disconnected {
                return Err(SubscribeError::Disconnected);
            }
            if state.subscriptions.contains_key(&stream_id) {
                return Err(SubscribeError::AlreadySubscribed(stream_id));
            }
            state
                .subscriptions
                .insert(stream_id.clone(), SubscriptionEntry { token, tx });
            state
                .correlation
                .insert(frame.id.clone(), CorrelationTarget::Subscription(stream_id.clone()));
        }

        let encoded = encode_frame(&frame).expect("subscribe frames always serialize");
        if self.shared.transport.send(encoded).await.is_err() {
            self.shared.remove_subscription(&stream_id, token);
            return Err(SubscribeError::Disconnected);
        }
        Ok(Subscription::new(
            stream_id.clone(),
            rx,
            SubscriptionCleanup {
                shared: self.shared.clone(),
                stream_id,
                token,
            },
        ))
    }

    /// Remove the subscription for `stream_id` and tell the server.
    pub async fn unsubscribe(&self, stream_id: &StreamId) {
        let removed = self.shared.state.lock().subscriptions.remove(stream_id);
        if removed.is_some() {
            self.shared.send_unsubscribe(stream_id).await;
        }
    }

    /// Liveness probe: send `ping`, await the matching `pong`.
    ///
    /// `false` on timeout or transport loss.
    pub async fn ping(&self) -> bool {
        let frame = Frame::new(FrameBody::Ping);
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.shared.state.lock();
            if state.disconnected {
                return false;
            }
            state.pings.insert(frame.id.clone(), tx);
        }
        let encoded = encode_frame(&frame).expect("ping frames always serialize");
        if self.shared.transport.send(encoded).await.is_err() {
            self.shared.state.lock().pings.remove(&frame.id);
            return false;
        }
        let answered = tokio::time::timeout(self.shared.config.command_timeout, rx)
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false);
        if !answered {
            self.shared.state.lock().pings.remove(&frame.id);
        }
        answered
    }

    /// Close the transport; fails everything pending with `Disconnected`.
    pub async fn close(&self) {
        self.shared.transport.close().await;
        fail_all_pending(&self.shared);
    }
}

impl Drop for EventClient {
    fn drop(&mut self) {
        self.router.abort();
        fail_all_pending(&self.shared);
    }
}

/// Removes a pending entry when the `send_command` future exits by any path
/// the router did not already consume (timeout, send failure, caller drop).
struct PendingGuard {
    shared: Arc<ClientShared>,
    command_id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.pending.remove(&self.command_id);
        state.correlation.remove(&self.command_id);
    }
}

impl ClientShared {
    pub(crate) fn remove_subscription(&self, stream_id: &StreamId, token: u64) -> bool {
        let mut state = self.state.lock();
        match state.subscriptions.get(stream_id) {
            // Only remove the registration this handle created; a newer
            // subscription under the same stream id stays untouched.
            Some(entry) if entry.token == token => {
                state.subscriptions.remove(stream_id);
                true
            }
            _ => false,
        }
    }

    pub(crate) async fn send_unsubscribe(&self, stream_id: &StreamId) {
        let frame = Frame::new(FrameBody::Unsubscribe(UnsubscribeBody {
            stream_id: stream_id.to_string(),
        }));
        if let Ok(encoded) = encode_frame(&frame) {
            // Best-effort: a dead transport is fine here.
            let _ = self.transport.send(encoded).await;
        }
    }

    pub(crate) fn is_disconnected(&self) -> bool {
        self.state.lock().disconnected
    }
}

fn command_frame(command: &Command) -> Frame {
    let mut frame = Frame::with_id(
        command.id.clone(),
        FrameBody::Command(CommandBody {
            aggregate: evl_protocol::AggregateRef {
                position: WirePosition {
                    stream_id: command.target.to_string(),
                    event_number: command.expected,
                },
                name: command.aggregate.clone(),
            },
            command_name: command.name.clone(),
            payload: command.payload.clone(),
            expected_version: None,
        }),
    );
    frame.metadata = command.metadata.clone();
    frame
}

async fn run_router(shared: Arc<ClientShared>, mut frames: BoxStream<'static, String>) {
    while let Some(text) = frames.next().await {
        route_frame(&shared, &text);
    }
    info!("transport closed; failing pending commands and ending subscriptions");
    fail_all_pending(&shared);
}

/// Terminal cleanup: every pending command completes with `Disconnected`,
/// every subscription ends, the registries empty out.
fn fail_all_pending(shared: &ClientShared) {
    let mut state = shared.state.lock();
    if state.disconnected {
        return;
    }
    state.disconnected = true;
    for (command_id, pending) in state.pending.drain() {
        let _ = pending
            .sink
            .send(Err(CommandError::disconnected(&command_id, &pending.command_name)));
    }
    // Dropping the senders ends each subscription stream.
    state.subscriptions.clear();
    state.correlation.clear();
    state.pings.clear();
}

fn route_frame(shared: &ClientShared, text: &str) {
    let frame = match evl_protocol::decode_frame(text) {
        Ok(frame) => frame,
        Err(e) => {
            // Malformed input never hurts the session.
            debug!(error = %e, "dropping undecodable frame");
            return;
        }
    };
    match frame.body {
        FrameBody::CommandResult(body) => route_command_result(shared, &frame.id, body),
        FrameBody::Event(body) => route_event(shared, body),
        FrameBody::SubscriptionAck(body) => {
            debug!(stream_id = %body.stream_id, is_live = body.is_live, "subscription acknowledged");
        }
        FrameBody::SubscriptionEnd(body) => {
            let Ok(stream_id) = StreamId::new(body.stream_id) else {
                return;
            };
            let removed = shared.state.lock().subscriptions.remove(&stream_id);
            if removed.is_some() {
                info!(stream_id = %stream_id, reason = ?body.reason, "subscription ended by server");
            }
        }
        FrameBody::Error(body) => route_error(shared, frame.correlation_id.as_deref(), body),
        FrameBody::Pong => {
            if let Some(waiter) = shared.state.lock().pings.remove(&frame.id) {
                let _ = waiter.send(());
            }
        }
        other => {
            debug!(frame = ?other, "dropping unexpected frame kind");
        }
    }
}

fn route_command_result(shared: &ClientShared, command_id: &str, body: CommandResultBody) {
    let pending = {
        let mut state = shared.state.lock();
        state.correlation.remove(command_id);
        state.pending.remove(command_id)
    };
    let Some(pending) = pending else {
        // Unknown or already-terminal command id (e.g. a reply arriving
        // after the deadline fired).
        debug!(command_id, "dropping result for unknown command");
        return;
    };

    let result: CommandResult = if body.success {
        match body.position.and_then(wire_position) {
            Some(position) => Ok(position),
            None => Err(CommandError::new(
                CommandErrorKind::Protocol,
                "success result without a valid position",
                command_id,
                &pending.command_name,
            )),
        }
    } else {
        let error = body.error.unwrap_or(evl_protocol::ErrorDetail {
            message: "unspecified failure".to_owned(),
            code: None,
            details: None,
        });
        let kind = error
            .code
            .as_deref()
            .map(CommandErrorKind::from_code)
            .unwrap_or(CommandErrorKind::Unknown);
        let mut failure =
            CommandError::new(kind, error.message, command_id, &pending.command_name);
        failure.details = error.details;
        Err(failure)
    };
    let _ = pending.sink.send(result);
}

fn route_event(shared: &ClientShared, body: evl_protocol::EventBody) {
    let Ok(stream_id) = StreamId::new(body.stream_id) else {
        return;
    };
    let event = RecordedEvent {
        stream_id: stream_id.clone(),
        event_number: body.event_number,
        global_position: body.position,
        payload: EventPayload {
            event_type: body.event_type,
            data: body.event,
            metadata: body.event_metadata,
        },
    };
    let state = shared.state.lock();
    match state.subscriptions.get(&stream_id) {
        Some(entry) => {
            // A dropped consumer is cleaned up by its handle; ignore here.
            let _ = entry.tx.send(event);
        }
        None => {
            debug!(stream_id = %stream_id, "dropping event for unknown subscription");
        }
    }
}

fn route_error(
    shared: &ClientShared,
    correlation_id: Option<&str>,
    body: evl_protocol::ErrorBody,
) {
    let Some(correlation_id) = correlation_id else {
        warn!(message = %body.error.message, "server error without correlation");
        return;
    };
    let pending = {
        let mut state = shared.state.lock();
        match state.correlation.remove(correlation_id) {
            Some(CorrelationTarget::Command(command_id)) => state.pending.remove(&command_id),
            Some(CorrelationTarget::Subscription(stream_id)) => {
                warn!(stream_id = %stream_id, message = %body.error.message, "server rejected subscribe");
                None
            }
            None => {
                debug!(correlation_id, "dropping error for unknown correlation");
                None
            }
        }
    };
    if let Some(pending) = pending {
        let _ = pending.sink.send(Err(CommandError::new(
            CommandErrorKind::Protocol,
            body.error.message,
            correlation_id,
            &pending.command_name,
        )));
    }
}

fn wire_position(position: WirePosition) -> Option<StreamPosition> {
    StreamId::new(position.stream_id)
        .ok()
        .map(|stream_id| StreamPosition::new(stream_id, position.event_number))
}
