// evl-protocol: session protocol frame types and serialization.
//
// Every frame is one UTF-8 JSON object per transport message, discriminated
// by a top-level `type` field.  The enum variants map 1:1 to the frozen v1
// frame kinds.  Field names on the wire are camelCase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// A single protocol frame: the envelope fields shared by every kind, plus
/// the kind-specific body flattened next to them.
///
/// ```json
/// { "id": "c1", "type": "command", "timestamp": "2026-08-01T00:00:00Z", ... }
/// ```
///
/// `id` is unique per sender lifetime.  On a `command` frame it doubles as
/// the command id; the matching `command_result` echoes it back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// Refers to some prior frame's `id` (error frames answering a request).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Free-form string-keyed metadata; propagated verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, Value>>,
    #[serde(flatten)]
    pub body: FrameBody,
}

impl Frame {
    /// Build a frame with a fresh uuid v4 `id` and the current UTC time.
    pub fn new(body: FrameBody) -> Self {
        Frame {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            correlation_id: None,
            metadata: None,
            body,
        }
    }

    /// Build a frame with a caller-chosen `id` (command frames, pong echoes).
    pub fn with_id(id: impl Into<String>, body: FrameBody) -> Self {
        Frame {
            id: id.into(),
            timestamp: Utc::now(),
            correlation_id: None,
            metadata: None,
            body,
        }
    }

    /// Set `correlationId`, consuming and returning the frame.
    pub fn correlated_to(mut self, request_id: impl Into<String>) -> Self {
        self.correlation_id = Some(request_id.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Shared sub-types
// ---------------------------------------------------------------------------

/// A (stream, event number) pair as it appears on the wire.
///
/// Identifies either the slot at which the next event would be appended or
/// the identity of a specific committed event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WirePosition {
    pub stream_id: String,
    pub event_number: u64,
}

/// Addressing block of a `command` frame: which aggregate, at which
/// expected stream position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateRef {
    pub position: WirePosition,
    pub name: String,
}

/// Error payload carried by `error` frames and failed `command_result`s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

// ---------------------------------------------------------------------------
// Client -> server bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeBody {
    pub stream_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_position: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_metadata: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeBody {
    pub stream_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandBody {
    pub aggregate: AggregateRef,
    /// PascalCase handler selector, e.g. `"CreateUser"`.
    pub command_name: String,
    /// Application-opaque; propagated verbatim.
    pub payload: Value,
    /// Overrides `aggregate.position.eventNumber` when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<u64>,
}

// ---------------------------------------------------------------------------
// Server -> client bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventBody {
    pub stream_id: String,
    pub event_number: u64,
    /// Process-wide commit order position.
    pub position: u64,
    pub event_type: String,
    /// Application-opaque event payload.
    pub event: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_metadata: Option<Value>,
}

/// Outcome of a command.  `id` on the carrying frame equals the originating
/// command's id.  Exactly one of `position` / `error` is present, matching
/// `success`; [`decode_frame`] rejects incoherent combinations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResultBody {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<WirePosition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionAckBody {
    pub stream_id: String,
    /// The stream's tail at ack time (next append slot).
    pub current_position: WirePosition,
    pub is_live: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionEndBody {
    pub stream_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

// ---------------------------------------------------------------------------
// Top-level discriminated union
// ---------------------------------------------------------------------------

/// All frame kinds in the v1 session protocol.
///
/// Serializes/deserializes using the `type` field as a tag.
///
/// Client -> server: `subscribe`, `unsubscribe`, `command`, `ping`.
/// Server -> client: `event`, `command_result`, `subscription_ack`,
/// `subscription_end`, `pong`, `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum FrameBody {
    Subscribe(SubscribeBody),
    Unsubscribe(UnsubscribeBody),
    Command(CommandBody),
    Ping,
    Event(EventBody),
    CommandResult(CommandResultBody),
    SubscriptionAck(SubscriptionAckBody),
    SubscriptionEnd(SubscriptionEndBody),
    Pong,
    Error(ErrorBody),
}

// ---------------------------------------------------------------------------
// Error code table
// ---------------------------------------------------------------------------

/// Frozen v1 error codes, as carried in `error.code`.
pub mod error_codes {
    pub const HANDLER_NOT_FOUND: &str = "HandlerNotFound";
    pub const EXECUTION_ERROR: &str = "ExecutionError";
    pub const CONCURRENCY_CONFLICT: &str = "ConcurrencyConflict";
    pub const STORE_ERROR: &str = "StoreError";
    pub const TIMEOUT: &str = "Timeout";
    pub const DISCONNECTED: &str = "Disconnected";
    pub const PROTOCOL: &str = "Protocol";
    pub const UNKNOWN: &str = "UnknownError";
    pub const DECODE: &str = "DecodeError";
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Failure to turn a [`Frame`] into wire text.
///
/// Can only arise from unserializable payload values, which the core never
/// constructs; callers treat it as a local bug, not a protocol error.
#[derive(Debug, thiserror::Error)]
#[error("frame encoding failed: {0}")]
pub struct EncodeError(#[from] serde_json::Error);

/// Failure to turn wire text into a [`Frame`].
///
/// Receivers drop the offending frame and keep the connection; malformed
/// input never terminates a session.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid frame shape: {0}")]
    Shape(String),
}

/// Serialize a frame to its one-JSON-object wire form.
pub fn encode_frame(frame: &Frame) -> Result<String, EncodeError> {
    Ok(serde_json::to_string(frame)?)
}

/// Parse and shape-validate one wire frame.
///
/// Rejects unknown `type` values, empty stream ids, and `command_result`
/// bodies whose `success` flag disagrees with the fields present.
pub fn decode_frame(text: &str) -> Result<Frame, DecodeError> {
    let frame: Frame = serde_json::from_str(text)?;
    validate(&frame)?;
    Ok(frame)
}

fn validate(frame: &Frame) -> Result<(), DecodeError> {
    if frame.id.is_empty() {
        return Err(DecodeError::Shape("empty frame id".to_owned()));
    }
    let stream_id = match &frame.body {
        FrameBody::Subscribe(b) => Some(&b.stream_id),
        FrameBody::Unsubscribe(b) => Some(&b.stream_id),
        FrameBody::Command(b) => Some(&b.aggregate.position.stream_id),
        FrameBody::Event(b) => Some(&b.stream_id),
        FrameBody::SubscriptionAck(b) => Some(&b.stream_id),
        FrameBody::SubscriptionEnd(b) => Some(&b.stream_id),
        _ => None,
    };
    if let Some(id) = stream_id
        && id.is_empty()
    {
        return Err(DecodeError::Shape("empty streamId".to_owned()));
    }
    if let FrameBody::Command(b) = &frame.body
        && b.command_name.is_empty()
    {
        return Err(DecodeError::Shape("empty commandName".to_owned()));
    }
    if let FrameBody::CommandResult(b) = &frame.body {
        match (b.success, &b.position, &b.error) {
            (true, Some(_), None) | (false, None, Some(_)) => {}
            _ => {
                return Err(DecodeError::Shape(
                    "command_result success flag disagrees with fields".to_owned(),
                ));
            }
        }
    }
    Ok(())
}
