//! Per-connection server protocol state: inbound frame routing, the
//! subscription set, and serialized outbound writes.

use std::collections::HashSet;
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use evl_core::command::CommandResult;
use evl_core::store::EventStore;
use evl_core::types::{EventNumber, RecordedEvent, StreamId, StreamPosition};
use evl_protocol::{
    CommandResultBody, ErrorBody, ErrorDetail, EventBody, Frame, FrameBody, SubscriptionAckBody,
    WirePosition, encode_frame, error_codes,
};
use evl_transport::MessageTransport;

/// A decoded command as received on the wire, ready for dispatch.
#[derive(Debug, Clone)]
pub struct WireCommand {
    pub command_id: String,
    pub aggregate: String,
    pub target: StreamId,
    /// PascalCase handler selector.
    pub name: String,
    pub payload: Value,
    pub metadata: Option<serde_json::Map<String, Value>>,
    /// Stream length the sender expects the target to have.
    pub expected: EventNumber,
}

/// One client session as the server sees it.
///
/// Outbound writes go through a single mutex, so frames on one connection
/// are totally ordered.  Events are only transmitted for streams in this
/// connection's subscription set.
pub struct ServerConnection {
    transport: Arc<dyn MessageTransport>,
    send_lock: tokio::sync::Mutex<()>,
    subscriptions: Mutex<HashSet<StreamId>>,
    store: Arc<dyn EventStore>,
}

impl ServerConnection {
    /// Start routing inbound frames.
    ///
    /// Returns the connection handle, the inbound command stream (completes
    /// when the connection ends), and the reader task handle.
    pub fn start(
        transport: Arc<dyn MessageTransport>,
        store: Arc<dyn EventStore>,
        command_buffer: usize,
    ) -> (Arc<Self>, mpsc::Receiver<WireCommand>, JoinHandle<()>) {
        let connection = Arc::new(ServerConnection {
            transport: transport.clone(),
            send_lock: tokio::sync::Mutex::new(()),
            subscriptions: Mutex::new(HashSet::new()),
            store,
        });
        let (command_tx, command_rx) = mpsc::channel(command_buffer);
        let reader = tokio::spawn(read_loop(connection.clone(), command_tx));
        (connection, command_rx, reader)
    }

    /// Serialized outbound write.  `false` when the transport refused the
    /// frame (it is disconnecting or gone).
    async fn send_frame(&self, frame: &Frame) -> bool {
        let encoded = match encode_frame(frame) {
            Ok(text) => text,
            Err(e) => {
                // Unserializable frames cannot be built by this module.
                warn!(error = %e, "dropping unencodable outbound frame");
                return false;
            }
        };
        let _guard = self.send_lock.lock().await;
        self.transport.send(encoded).await.is_ok()
    }

    /// Send the `command_result` frame for `command_id`.
    pub async fn send_result(&self, command_id: &str, result: &CommandResult) {
        let body = match result {
            Ok(position) => CommandResultBody {
                success: true,
                position: Some(WirePosition {
                    stream_id: position.stream_id.to_string(),
                    event_number: position.event_number,
                }),
                error: None,
            },
            Err(failure) => CommandResultBody {
                success: false,
                position: None,
                error: Some(ErrorDetail {
                    message: failure.message.clone(),
                    code: Some(failure.kind.code().to_owned()),
                    details: failure.details.clone(),
                }),
            },
        };
        let frame = Frame::with_id(command_id, FrameBody::CommandResult(body));
        if !self.send_frame(&frame).await {
            debug!(command_id, "result not delivered; connection gone");
        }
    }

    /// Transmit `event` iff this connection is subscribed to its stream.
    ///
    /// Returns `false` when the frame was due but could not be sent.
    pub async fn publish_event(&self, event: &RecordedEvent) -> bool {
        if !self.subscriptions.lock().contains(&event.stream_id) {
            return true;
        }
        self.send_event_frame(event).await
    }

    async fn send_event_frame(&self, event: &RecordedEvent) -> bool {
        let frame = Frame::new(FrameBody::Event(EventBody {
            stream_id: event.stream_id.to_string(),
            event_number: event.event_number,
            position: event.global_position,
            event_type: event.payload.event_type.clone(),
            event: event.payload.data.clone(),
            event_metadata: event.payload.metadata.clone(),
        }));
        self.send_frame(&frame).await
    }

    pub fn is_subscribed(&self, stream_id: &StreamId) -> bool {
        self.subscriptions.lock().contains(stream_id)
    }

    async fn handle_subscribe(&self, stream_id: StreamId, from: Option<EventNumber>) {
        // Catch-up replay: transmit the persisted tail before going live.
        // Events committed while the replay runs land in the live path
        // only after the set insert below; that gap is the same
        // best-effort window the live fan-out itself has.
        if let Some(from) = from {
            let mut replay = self
                .store
                .read(StreamPosition::new(stream_id.clone(), from));
            while let Some(event) = replay.next().await {
                match event {
                    Ok(event) => {
                        if !self.send_event_frame(&event).await {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(stream_id = %stream_id, error = %e, "replay aborted");
                        break;
                    }
                }
            }
        }
        self.subscriptions.lock().insert(stream_id.clone());
        // Ack with the stream's current tail; a store hiccup degrades the
        // ack metadata, not the subscription.
        let current = match self.store.head(&stream_id).await {
            Ok(position) => position.event_number,
            Err(e) => {
                warn!(stream_id = %stream_id, error = %e, "head lookup failed for subscription ack");
                0
            }
        };
        let frame = Frame::new(FrameBody::SubscriptionAck(SubscriptionAckBody {
            stream_id: stream_id.to_string(),
            current_position: WirePosition {
                stream_id: stream_id.to_string(),
                event_number: current,
            },
            is_live: true,
        }));
        self.send_frame(&frame).await;
    }

    async fn handle_malformed(&self, reason: &str) {
        debug!(reason, "dropping malformed frame");
        let frame = Frame::new(FrameBody::Error(ErrorBody {
            error: ErrorDetail {
                message: reason.to_owned(),
                code: Some(error_codes::DECODE.to_owned()),
                details: None,
            },
        }));
        // Best-effort courtesy reply; the connection stays up either way.
        self.send_frame(&frame).await;
    }
}

async fn read_loop(connection: Arc<ServerConnection>, command_tx: mpsc::Sender<WireCommand>) {
    let mut frames = connection.transport.receive();
    while let Some(text) = frames.next().await {
        let frame = match evl_protocol::decode_frame(&text) {
            Ok(frame) => frame,
            Err(e) => {
                connection.handle_malformed(&e.to_string()).await;
                continue;
            }
        };
        match frame.body {
            FrameBody::Subscribe(body) => {
                let Ok(stream_id) = StreamId::new(body.stream_id) else {
                    continue;
                };
                connection
                    .handle_subscribe(stream_id, body.from_position)
                    .await;
            }
            FrameBody::Unsubscribe(body) => {
                let Ok(stream_id) = StreamId::new(body.stream_id) else {
                    continue;
                };
                connection.subscriptions.lock().remove(&stream_id);
            }
            FrameBody::Command(body) => {
                let Ok(target) = StreamId::new(body.aggregate.position.stream_id.clone()) else {
                    continue;
                };
                let command = WireCommand {
                    command_id: frame.id,
                    aggregate: body.aggregate.name,
                    target,
                    name: body.command_name,
                    payload: body.payload,
                    metadata: frame.metadata,
                    expected: body
                        .expected_version
                        .unwrap_or(body.aggregate.position.event_number),
                };
                // Bounded channel: the only flow control on command intake.
                if command_tx.send(command).await.is_err() {
                    break;
                }
            }
            FrameBody::Ping => {
                let pong = Frame::with_id(frame.id, FrameBody::Pong);
                connection.send_frame(&pong).await;
            }
            other => {
                debug!(frame = ?other, "dropping unexpected inbound frame kind");
            }
        }
    }
    debug!("connection reader finished");
    // command_tx drops here; the inbound command stream completes.
}
