//! In-memory event store backend.
//!
//! Streams live in a `HashMap` behind one lock; `subscribe_all` is fed from
//! a broadcast tap written under the same lock, so the live sequence
//! observes exactly the commit order.  Lagging subscribers skip missed
//! events instead of erroring.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use super::{EventStore, EventStoreError};
use crate::types::{EventPayload, RecordedEvent, StreamId, StreamPosition};

const SUBSCRIBE_ALL_CAPACITY: usize = 1024;

struct Inner {
    streams: HashMap<StreamId, Vec<RecordedEvent>>,
    global_position: u64,
}

/// An embedded, process-local [`EventStore`].
#[derive(Clone)]
pub struct MemoryEventStore {
    inner: Arc<Mutex<Inner>>,
    tx: broadcast::Sender<RecordedEvent>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(SUBSCRIBE_ALL_CAPACITY);
        MemoryEventStore {
            inner: Arc::new(Mutex::new(Inner {
                streams: HashMap::new(),
                global_position: 0,
            })),
            tx,
        }
    }

    /// Number of committed events across all streams.
    pub fn committed_count(&self) -> u64 {
        self.inner.lock().global_position
    }
}

impl Default for MemoryEventStore {
    fn default() -> Self {
        MemoryEventStore::new()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(
        &self,
        expected: StreamPosition,
        events: Vec<EventPayload>,
    ) -> Result<StreamPosition, EventStoreError> {
        let mut inner = self.inner.lock();
        let actual = inner
            .streams
            .get(&expected.stream_id)
            .map(Vec::len)
            .unwrap_or(0) as u64;
        if actual != expected.event_number {
            return Err(EventStoreError::ConcurrencyConflict {
                stream_id: expected.stream_id,
                expected: expected.event_number,
                actual,
            });
        }
        if events.is_empty() {
            return Ok(expected);
        }

        let mut recorded = Vec::with_capacity(events.len());
        for (index, payload) in events.into_iter().enumerate() {
            inner.global_position += 1;
            recorded.push(RecordedEvent {
                stream_id: expected.stream_id.clone(),
                event_number: expected.event_number + index as u64,
                global_position: inner.global_position,
                payload,
            });
        }
        let next = expected.event_number + recorded.len() as u64;
        inner
            .streams
            .entry(expected.stream_id.clone())
            .or_default()
            .extend(recorded.iter().cloned());

        // Publish under the lock: commit order and broadcast order coincide.
        for event in recorded {
            let _ = self.tx.send(event);
        }
        Ok(StreamPosition::new(expected.stream_id, next))
    }

    fn read(
        &self,
        from: StreamPosition,
    ) -> BoxStream<'static, Result<RecordedEvent, EventStoreError>> {
        let tail: Vec<RecordedEvent> = {
            let inner = self.inner.lock();
            inner
                .streams
                .get(&from.stream_id)
                .map(|events| {
                    events
                        .iter()
                        .skip(from.event_number as usize)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };
        stream::iter(tail.into_iter().map(Ok)).boxed()
    }

    fn subscribe_all(&self) -> BoxStream<'static, RecordedEvent> {
        BroadcastStream::new(self.tx.subscribe())
            .filter_map(|item| futures::future::ready(item.ok()))
            .boxed()
    }

    async fn head(&self, stream_id: &StreamId) -> Result<StreamPosition, EventStoreError> {
        let length = self
            .inner
            .lock()
            .streams
            .get(stream_id)
            .map(Vec::len)
            .unwrap_or(0) as u64;
        Ok(StreamPosition::new(stream_id.clone(), length))
    }
}
