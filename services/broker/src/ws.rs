//! WebSocket endpoint: adapts an upgraded axum socket into a session
//! transport and hands it to the session host.

use std::sync::Arc;

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::BoxStream};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};

use crate::AppState;
use evl_transport::{ConnectionState, MessageTransport, TransportError};

pub async fn ws_session_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_session(socket, state))
}

async fn handle_session(socket: WebSocket, state: AppState) {
    info!("session connected");
    let transport = Arc::new(ServerWsTransport::start(socket));
    let session = state.host.spawn_session(transport);
    // Hold the upgrade future open until the protocol session finishes.
    let _ = session.await;
    info!("session closed");
}

/// Server side of one upgraded WebSocket, as a [`MessageTransport`].
///
/// Mirrors the client transport: a writer task drains the outbound queue, a
/// reader task feeds the receive stream and answers socket-level pings.
struct ServerWsTransport {
    out_tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl ServerWsTransport {
    fn start(socket: WebSocket) -> Self {
        let (mut write, mut read) = socket.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);
        let state_tx = Arc::new(state_tx);

        let writer_state = state_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Err(e) = write.send(msg).await {
                    debug!(error = %e, "websocket write failed");
                    break;
                }
            }
            let _ = write.send(Message::Close(None)).await;
            mark_disconnected(&writer_state);
        });

        let reader_state = state_tx.clone();
        let pong_tx = out_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(text.to_string()).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Ping(data)) => {
                        let _ = pong_tx.send(Message::Pong(data));
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!(error = %e, "websocket read failed");
                        break;
                    }
                }
            }
            mark_disconnected(&reader_state);
        });

        ServerWsTransport {
            out_tx: Mutex::new(Some(out_tx)),
            rx: Mutex::new(Some(in_rx)),
            state_tx,
            state_rx,
        }
    }
}

fn mark_disconnected(state_tx: &watch::Sender<ConnectionState>) {
    state_tx.send_if_modified(|state| {
        if state.is_terminal() {
            false
        } else {
            *state = ConnectionState::Disconnected;
            true
        }
    });
}

#[async_trait::async_trait]
impl MessageTransport for ServerWsTransport {
    async fn send(&self, frame: String) -> Result<(), TransportError> {
        if self.state_rx.borrow().is_terminal() {
            return Err(TransportError::NotConnected);
        }
        let sent = match self.out_tx.lock().as_ref() {
            Some(tx) => tx.send(Message::Text(frame.into())).is_ok(),
            None => false,
        };
        if sent {
            Ok(())
        } else {
            mark_disconnected(&self.state_tx);
            Err(TransportError::NotConnected)
        }
    }

    fn receive(&self) -> BoxStream<'static, String> {
        let Some(rx) = self.rx.lock().take() else {
            return futures_util::stream::empty().boxed();
        };
        UnboundedReceiverStream::new(rx).boxed()
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    async fn close(&self) {
        mark_disconnected(&self.state_tx);
        self.out_tx.lock().take();
    }
}
