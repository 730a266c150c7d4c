//! In-process live pub/sub of committed events.
//!
//! One pump task consumes the store's `subscribe_all` stream and multicasts
//! each event to every registered subscriber whose filter accepts it.
//! Each subscriber has an independent **unbounded** queue: a slow subscriber
//! costs memory but never delays or drops delivery to the others.
//!
//! The bus is a scoped resource: dropping it stops the pump and tears down
//! every subscriber queue.  It never restarts a finished upstream.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::warn;

use crate::types::RecordedEvent;

type FilterFn = Arc<dyn Fn(&RecordedEvent) -> bool + Send + Sync>;

struct BusSubscriber {
    tx: mpsc::UnboundedSender<RecordedEvent>,
    filter: FilterFn,
}

/// Live-only multicast of committed events to filtered subscribers.
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<BusSubscriber>>>,
    pump: JoinHandle<()>,
}

impl EventBus {
    /// Fork the pump over `upstream` (normally `EventStore::subscribe_all`).
    ///
    /// When `upstream` ends, every subscriber sees end-of-stream; the bus
    /// does not resubscribe on its own.
    pub fn start(upstream: BoxStream<'static, RecordedEvent>) -> Self {
        let subscribers: Arc<Mutex<Vec<BusSubscriber>>> = Arc::new(Mutex::new(Vec::new()));
        let pump_subscribers = subscribers.clone();
        let pump = tokio::spawn(async move {
            let mut upstream = upstream;
            while let Some(event) = upstream.next().await {
                deliver(&pump_subscribers, &event);
            }
            // Upstream ended: close every subscriber queue.
            pump_subscribers.lock().clear();
        });
        EventBus { subscribers, pump }
    }

    /// Register a subscriber; only events committed from now on and accepted
    /// by `filter` are delivered.
    ///
    /// The queue is unbounded; drop the returned subscription to release it.
    pub fn subscribe<F>(&self, filter: F) -> BusSubscription
    where
        F: Fn(&RecordedEvent) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(BusSubscriber {
            tx,
            filter: Arc::new(filter),
        });
        BusSubscription {
            inner: UnboundedReceiverStream::new(rx),
        }
    }

    /// Number of currently-registered subscribers (observability hook).
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.pump.abort();
        self.subscribers.lock().clear();
    }
}

/// Offer one event to every subscriber.  Dropped subscriptions are pruned;
/// a panicking filter skips the event for that subscriber only.
fn deliver(subscribers: &Mutex<Vec<BusSubscriber>>, event: &RecordedEvent) {
    subscribers.lock().retain(|subscriber| {
        let accepted = catch_unwind(AssertUnwindSafe(|| (subscriber.filter)(event)));
        match accepted {
            Ok(true) => subscriber.tx.send(event.clone()).is_ok(),
            Ok(false) => true,
            Err(_) => {
                warn!(
                    stream_id = %event.stream_id,
                    event_number = event.event_number,
                    "subscriber filter panicked; skipping event for that subscriber"
                );
                true
            }
        }
    });
}

/// A live subscription handle; a `Stream` of the accepted events.
///
/// Ends when the bus's upstream ends or the bus is dropped.  Dropping the
/// subscription releases its queue.
pub struct BusSubscription {
    inner: UnboundedReceiverStream<RecordedEvent>,
}

impl Stream for BusSubscription {
    type Item = RecordedEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
