//! In-memory duplex transport.
//!
//! Two cross-wired unbounded channels; no bytes, no sockets.  Used by the
//! test suites and by single-process deployments that colocate client and
//! server.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{ConnectionState, MessageTransport, TransportError, TransportListener, mark_disconnected};

/// One side of an in-memory duplex connection.
pub struct LoopbackTransport {
    peer_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    peer_state_tx: Arc<watch::Sender<ConnectionState>>,
}

/// Build a connected pair.  Closing either side disconnects both.
pub fn loopback_pair() -> (LoopbackTransport, LoopbackTransport) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let (a_state_tx, a_state_rx) = watch::channel(ConnectionState::Connected);
    let (b_state_tx, b_state_rx) = watch::channel(ConnectionState::Connected);
    let a_state_tx = Arc::new(a_state_tx);
    let b_state_tx = Arc::new(b_state_tx);

    let a = LoopbackTransport {
        peer_tx: Mutex::new(Some(b_tx)),
        rx: Mutex::new(Some(a_rx)),
        state_tx: a_state_tx.clone(),
        state_rx: a_state_rx,
        peer_state_tx: b_state_tx.clone(),
    };
    let b = LoopbackTransport {
        peer_tx: Mutex::new(Some(a_tx)),
        rx: Mutex::new(Some(b_rx)),
        state_tx: b_state_tx,
        state_rx: b_state_rx,
        peer_state_tx: a_state_tx,
    };
    (a, b)
}

impl LoopbackTransport {
    fn disconnect_both(&self) {
        mark_disconnected(&self.state_tx);
        mark_disconnected(&self.peer_state_tx);
        // Dropping the sender ends the peer's receive stream.
        self.peer_tx.lock().take();
    }
}

#[async_trait]
impl MessageTransport for LoopbackTransport {
    async fn send(&self, frame: String) -> Result<(), TransportError> {
        if self.state_rx.borrow().is_terminal() {
            return Err(TransportError::NotConnected);
        }
        let sent = match self.peer_tx.lock().as_ref() {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        };
        if sent {
            Ok(())
        } else {
            // Peer side is gone.
            self.disconnect_both();
            Err(TransportError::NotConnected)
        }
    }

    fn receive(&self) -> BoxStream<'static, String> {
        let Some(rx) = self.rx.lock().take() else {
            return stream::empty().boxed();
        };
        let mut state = self.state_rx.clone();
        let closed = async move {
            loop {
                let terminal = state.borrow().is_terminal();
                if terminal {
                    return;
                }
                if state.changed().await.is_err() {
                    return;
                }
            }
        };
        UnboundedReceiverStream::new(rx).take_until(closed).boxed()
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    async fn close(&self) {
        self.disconnect_both();
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.disconnect_both();
    }
}

/// Listener half of [`loopback_listener`].
pub struct LoopbackListener {
    rx: mpsc::UnboundedReceiver<LoopbackTransport>,
}

/// Dial half of [`loopback_listener`]; clone freely.
#[derive(Clone)]
pub struct LoopbackConnector {
    tx: mpsc::UnboundedSender<LoopbackTransport>,
}

/// An in-memory accept loop: every `connect` yields a fresh pair, the far
/// side surfacing through [`LoopbackListener::accept`].
pub fn loopback_listener() -> (LoopbackConnector, LoopbackListener) {
    let (tx, rx) = mpsc::unbounded_channel();
    (LoopbackConnector { tx }, LoopbackListener { rx })
}

impl LoopbackConnector {
    pub fn connect(&self) -> Result<LoopbackTransport, TransportError> {
        let (client_side, server_side) = loopback_pair();
        self.tx
            .send(server_side)
            .map_err(|_| TransportError::NotConnected)?;
        Ok(client_side)
    }
}

#[async_trait]
impl TransportListener for LoopbackListener {
    async fn accept(&mut self) -> Option<Arc<dyn MessageTransport>> {
        self.rx
            .recv()
            .await
            .map(|t| Arc::new(t) as Arc<dyn MessageTransport>)
    }
}
