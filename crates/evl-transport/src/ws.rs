//! WebSocket client transport.
//!
//! One protocol frame per WebSocket text message.  Two background tasks
//! drive the socket: a writer draining the outbound queue and a reader
//! pushing inbound text frames to the receive stream.  Transport-level pings
//! are answered in the reader; protocol-level ping/pong frames are ordinary
//! text messages and pass through untouched.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use futures_util::SinkExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, warn};

use crate::{ConnectionState, MessageTransport, TransportError, mark_disconnected};

/// A client connection over `ws://` / `wss://`.
pub struct WsTransport {
    out_tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl WsTransport {
    /// Connect to `url` and complete the WebSocket handshake.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let (socket, _response) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
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
                        warn!(error = %e, "websocket read failed");
                        break;
                    }
                }
            }
            mark_disconnected(&reader_state);
            // in_tx drops here, ending the receive stream.
        });

        Ok(WsTransport {
            out_tx: Mutex::new(Some(out_tx)),
            rx: Mutex::new(Some(in_rx)),
            state_tx,
            state_rx,
        })
    }
}

#[async_trait]
impl MessageTransport for WsTransport {
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
            return stream::empty().boxed();
        };
        UnboundedReceiverStream::new(rx).boxed()
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    async fn close(&self) {
        mark_disconnected(&self.state_tx);
        // Dropping the outbound queue lets the writer flush and send Close.
        self.out_tx.lock().take();
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        mark_disconnected(&self.state_tx);
        self.out_tx.lock().take();
    }
}
