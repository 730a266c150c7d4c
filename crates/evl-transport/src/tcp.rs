//! Plain TCP transport: one protocol frame per line.
//!
//! Frames are single-line JSON, so newline framing is exact.  The reader
//! and writer tasks mirror the WebSocket transport; there is no handshake
//! beyond the TCP connect.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use crate::{ConnectionState, MessageTransport, TransportError, TransportListener, mark_disconnected};

/// One TCP connection carrying newline-delimited frames.
pub struct TcpTransport {
    out_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl TcpTransport {
    /// Connect to `addr` (e.g. `"127.0.0.1:4551"`).
    pub async fn connect(addr: &str) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok(TcpTransport::from_stream(stream))
    }

    /// Wrap an already-established socket (both the dialing and the
    /// accepting side use this).
    pub fn from_stream(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);
        let state_tx = Arc::new(state_tx);

        let writer_state = state_tx.clone();
        tokio::spawn(async move {
            let mut writer = BufWriter::new(write_half);
            while let Some(frame) = out_rx.recv().await {
                if writer.write_all(frame.as_bytes()).await.is_err()
                    || writer.write_all(b"\n").await.is_err()
                    || writer.flush().await.is_err()
                {
                    debug!("tcp write failed");
                    break;
                }
            }
            mark_disconnected(&writer_state);
        });

        let reader_state = state_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if in_tx.send(line).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(error = %e, "tcp read failed");
                        break;
                    }
                }
            }
            mark_disconnected(&reader_state);
        });

        TcpTransport {
            out_tx: Mutex::new(Some(out_tx)),
            rx: Mutex::new(Some(in_rx)),
            state_tx,
            state_rx,
        }
    }
}

#[async_trait]
impl MessageTransport for TcpTransport {
    async fn send(&self, frame: String) -> Result<(), TransportError> {
        if self.state_rx.borrow().is_terminal() {
            return Err(TransportError::NotConnected);
        }
        let sent = match self.out_tx.lock().as_ref() {
            Some(tx) => tx.send(frame).is_ok(),
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
        // Dropping the queue lets the writer flush, then the socket drops.
        self.out_tx.lock().take();
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        mark_disconnected(&self.state_tx);
        self.out_tx.lock().take();
    }
}

/// Accept loop over a bound TCP socket; each accepted connection surfaces
/// as a session transport.
pub struct TcpListenerTransport {
    listener: TcpListener,
}

impl TcpListenerTransport {
    /// Bind on `addr` (use `"127.0.0.1:0"` to let the OS choose a port).
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok(TcpListenerTransport { listener })
    }

    /// The bound local address (useful when port 0 was used).
    pub fn local_addr(&self) -> SocketAddr {
        self.listener
            .local_addr()
            .expect("local_addr always succeeds after bind")
    }
}

#[async_trait]
impl TransportListener for TcpListenerTransport {
    async fn accept(&mut self) -> Option<Arc<dyn MessageTransport>> {
        match self.listener.accept().await {
            Ok((stream, _peer)) => {
                Some(Arc::new(TcpTransport::from_stream(stream)) as Arc<dyn MessageTransport>)
            }
            Err(e) => {
                debug!(error = %e, "tcp accept failed");
                None
            }
        }
    }
}
