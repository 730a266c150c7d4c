//! Stream identities, positions and event records.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-stream event index.  Starts at 0 for the first event of a stream and
/// increases without gaps.
pub type EventNumber = u64;

/// Opaque non-empty identifier of an event stream.  Equality is by bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StreamId(String);

/// Rejected stream identifier (the only illegal value is the empty string).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("stream id must not be empty")]
pub struct InvalidStreamId;

impl StreamId {
    pub fn new(id: impl Into<String>) -> Result<Self, InvalidStreamId> {
        let id = id.into();
        if id.is_empty() {
            Err(InvalidStreamId)
        } else {
            Ok(StreamId(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for StreamId {
    type Error = InvalidStreamId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        StreamId::new(value)
    }
}

impl From<StreamId> for String {
    fn from(id: StreamId) -> String {
        id.0
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for StreamId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The slot at which the next event of a stream would be appended, or the
/// identity of a specific committed event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamPosition {
    pub stream_id: StreamId,
    pub event_number: EventNumber,
}

impl StreamPosition {
    pub fn new(stream_id: StreamId, event_number: EventNumber) -> Self {
        StreamPosition {
            stream_id,
            event_number,
        }
    }

    /// Position 0 of a stream: the expected position when the stream must
    /// not yet exist.
    pub fn start(stream_id: StreamId) -> Self {
        StreamPosition {
            stream_id,
            event_number: 0,
        }
    }
}

impl std::fmt::Display for StreamPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.stream_id, self.event_number)
    }
}

/// An application-opaque event: a type tag plus payload data the core never
/// interprets, only propagates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub event_type: String,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl EventPayload {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        EventPayload {
            event_type: event_type.into(),
            data,
            metadata: None,
        }
    }
}

/// A committed event, decorated with its stream position and its
/// process-wide commit order position (1-based).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub stream_id: StreamId,
    pub event_number: EventNumber,
    pub global_position: u64,
    pub payload: EventPayload,
}

impl RecordedEvent {
    pub fn position(&self) -> StreamPosition {
        StreamPosition::new(self.stream_id.clone(), self.event_number)
    }
}
