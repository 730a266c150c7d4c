use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use evl_core::types::{RecordedEvent, StreamId};

use crate::client::ClientShared;

/// A live event stream for one stream id.
///
/// Yields events in commit order for that stream; ends on server
/// `subscription_end` or transport loss.  Dropping the handle removes the
/// registration and sends a best-effort `unsubscribe`.
pub struct Subscription {
    stream_id: StreamId,
    inner: UnboundedReceiverStream<RecordedEvent>,
    cleanup: Option<SubscriptionCleanup>,
}

impl Subscription {
    pub(crate) fn new(
        stream_id: StreamId,
        rx: mpsc::UnboundedReceiver<RecordedEvent>,
        cleanup: SubscriptionCleanup,
    ) -> Self {
        Subscription {
            stream_id,
            inner: UnboundedReceiverStream::new(rx),
            cleanup: Some(cleanup),
        }
    }

    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("stream_id", &self.stream_id)
            .finish()
    }
}

impl Stream for Subscription {
    type Item = RecordedEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup.run();
        }
    }
}

pub(crate) struct SubscriptionCleanup {
    pub(crate) shared: Arc<ClientShared>,
    pub(crate) stream_id: StreamId,
    pub(crate) token: u64,
}

impl SubscriptionCleanup {
    /// Remove this handle's registration; notify the server if it was still
    /// present and the session is alive.
    fn run(self) {
        let removed = self.shared.remove_subscription(&self.stream_id, self.token);
        if !removed || self.shared.is_disconnected() {
            return;
        }
        // Best-effort unsubscribe; requires a runtime, silently skipped
        // during teardown outside one.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let shared = self.shared;
            let stream_id = self.stream_id;
            handle.spawn(async move {
                shared.send_unsubscribe(&stream_id).await;
            });
        }
    }
}
