//! Minimal frame-oriented connection abstraction the protocols consume.
//!
//! A transport moves whole text frames (one JSON object each) between two
//! peers and reports its lifecycle through a watch channel.  The state is
//! monotone: once `Disconnected`, a transport never returns to `Connected`;
//! a new transport must be created to reconnect.

pub mod loopback;
pub mod tcp;
pub mod ws;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::watch;

pub use loopback::{
    LoopbackConnector, LoopbackListener, LoopbackTransport, loopback_listener, loopback_pair,
};
pub use tcp::{TcpListenerTransport, TcpTransport};
pub use ws::WsTransport;

/// Connection lifecycle, reported via [`MessageTransport::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Error,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Error)
    }
}

/// Transport-level failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The connection is not currently connected.
    #[error("transport is not connected")]
    NotConnected,
    /// Establishing the connection failed.
    #[error("connect failed: {0}")]
    Connect(String),
}

/// One bidirectional frame-oriented connection.
///
/// `receive` hands out the inbound frame stream; it is single-consumer, and
/// a second call returns an already-ended stream.  The stream ends on close
/// or peer disconnect.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Send one frame.  Fails when the connection is not `Connected`.
    async fn send(&self, frame: String) -> Result<(), TransportError>;

    /// Take the inbound frame stream.  Ends on close.
    fn receive(&self) -> BoxStream<'static, String>;

    /// Watch the connection lifecycle.
    fn state(&self) -> watch::Receiver<ConnectionState>;

    /// Close the connection.  Idempotent.
    async fn close(&self);
}

/// Server-side analogue: a source of incoming per-connection transports.
#[async_trait]
pub trait TransportListener: Send {
    /// Wait for the next incoming session; `None` when the listener closed.
    async fn accept(&mut self) -> Option<std::sync::Arc<dyn MessageTransport>>;
}

/// Flip a state watch to `Disconnected` exactly once.
pub(crate) fn mark_disconnected(state_tx: &watch::Sender<ConnectionState>) {
    state_tx.send_if_modified(|state| {
        if state.is_terminal() {
            false
        } else {
            *state = ConnectionState::Disconnected;
            true
        }
    });
}
