//! The append/read/subscribe-all port the dispatcher and bus consume, plus
//! the embedded backends.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;

use crate::types::{EventNumber, EventPayload, RecordedEvent, StreamId, StreamPosition};

/// Store failures visible through the port.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventStoreError {
    /// The stream's current length differed from the expected position.
    /// Nothing was written.
    #[error("concurrency conflict on {stream_id}: expected {expected}, actual {actual}")]
    ConcurrencyConflict {
        stream_id: StreamId,
        expected: EventNumber,
        actual: EventNumber,
    },
    /// Backend infrastructure failure (I/O, corruption, closed store).
    #[error("store backend error: {message}")]
    Backend { message: String },
}

impl EventStoreError {
    pub fn backend(message: impl Into<String>) -> Self {
        EventStoreError::Backend {
            message: message.into(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, EventStoreError::ConcurrencyConflict { .. })
    }
}

/// Ordered per-stream append with optimistic concurrency, lazy reads, and a
/// process-wide live subscription to committed events.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append `events` at `expected`.
    ///
    /// `expected.event_number` must equal the stream's current length
    /// (0 means the stream must not exist yet); a mismatch fails with
    /// [`EventStoreError::ConcurrencyConflict`] without mutation.  The
    /// batch commits atomically.  Returns the position one past the last
    /// appended event; an empty batch returns `expected` untouched.
    async fn append(
        &self,
        expected: StreamPosition,
        events: Vec<EventPayload>,
    ) -> Result<StreamPosition, EventStoreError>;

    /// Lazy finite sequence of committed events starting at
    /// `from.event_number`, ending at the currently-persisted tail.
    fn read(
        &self,
        from: StreamPosition,
    ) -> BoxStream<'static, Result<RecordedEvent, EventStoreError>>;

    /// Live-only sequence of all committed events in commit order.
    ///
    /// A subscriber only sees events committed after its subscription
    /// begins.  Backends may drop for a lagging subscriber under overload;
    /// missed events are undelivered, not failed.
    fn subscribe_all(&self) -> BoxStream<'static, RecordedEvent>;

    /// The stream's tail: the position at which the next append would land.
    ///
    /// The default implementation folds [`read`](Self::read); backends
    /// override it with a constant-time lookup.
    async fn head(&self, stream_id: &StreamId) -> Result<StreamPosition, EventStoreError> {
        let mut events = self.read(StreamPosition::start(stream_id.clone()));
        let mut length: EventNumber = 0;
        while let Some(event) = events.next().await {
            event?;
            length += 1;
        }
        Ok(StreamPosition::new(stream_id.clone(), length))
    }
}
