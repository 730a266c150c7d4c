//! Commands and their terminal outcomes.

use serde_json::Value;

use crate::types::{EventNumber, StreamId, StreamPosition};

/// A client-originated request addressed to an aggregate.
///
/// `id` is unique per connection for the lifetime of the pending response;
/// reuse is only legal after terminal completion.  `expected` is the
/// stream length the sender believes the target currently has; it is
/// checked against the store at dispatch time.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub id: String,
    pub aggregate: String,
    pub target: StreamId,
    /// PascalCase handler selector, e.g. `"CreateUser"`.
    pub name: String,
    pub payload: Value,
    pub metadata: Option<serde_json::Map<String, Value>>,
    pub expected: EventNumber,
}

impl Command {
    /// Build a command with a fresh uuid v4 id and `expected = 0` (stream
    /// must not yet exist).
    pub fn new(
        aggregate: impl Into<String>,
        target: StreamId,
        name: impl Into<String>,
        payload: Value,
    ) -> Self {
        Command {
            id: uuid::Uuid::new_v4().to_string(),
            aggregate: aggregate.into(),
            target,
            name: name.into(),
            payload,
            metadata: None,
            expected: 0,
        }
    }

    pub fn expected(mut self, event_number: EventNumber) -> Self {
        self.expected = event_number;
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// The single terminal outcome of a command: a committed position or a
/// classified failure.
pub type CommandResult = Result<StreamPosition, CommandError>;

/// Finite, stable classification of command failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandErrorKind {
    /// No aggregate exposes a handler for the command name.
    HandlerNotFound,
    /// The handler raised a domain error.
    ExecutionError,
    /// Expected stream position did not match the actual one.
    ConcurrencyConflict,
    /// Load or append failed for infrastructure reasons.
    StoreError,
    /// The pending-command deadline fired before a result arrived.
    Timeout,
    /// The transport closed while the command was pending.
    Disconnected,
    /// The server answered with an `error` frame correlated to the command.
    Protocol,
    /// Unclassified failure.
    Unknown,
}

impl CommandErrorKind {
    /// The wire `error.code` string for this kind.
    pub fn code(self) -> &'static str {
        match self {
            CommandErrorKind::HandlerNotFound => "HandlerNotFound",
            CommandErrorKind::ExecutionError => "ExecutionError",
            CommandErrorKind::ConcurrencyConflict => "ConcurrencyConflict",
            CommandErrorKind::StoreError => "StoreError",
            CommandErrorKind::Timeout => "Timeout",
            CommandErrorKind::Disconnected => "Disconnected",
            CommandErrorKind::Protocol => "Protocol",
            CommandErrorKind::Unknown => "UnknownError",
        }
    }

    /// Inverse of [`code`](Self::code); unknown codes map to `Unknown`.
    pub fn from_code(code: &str) -> Self {
        match code {
            "HandlerNotFound" => CommandErrorKind::HandlerNotFound,
            "ExecutionError" => CommandErrorKind::ExecutionError,
            "ConcurrencyConflict" => CommandErrorKind::ConcurrencyConflict,
            "StoreError" => CommandErrorKind::StoreError,
            "Timeout" => CommandErrorKind::Timeout,
            "Disconnected" => CommandErrorKind::Disconnected,
            "Protocol" => CommandErrorKind::Protocol,
            _ => CommandErrorKind::Unknown,
        }
    }
}

/// A classified command failure, carrying enough context for the caller to
/// attribute it to the originating command.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("command {command_name} ({command_id}) failed: {kind:?}: {message}")]
pub struct CommandError {
    pub kind: CommandErrorKind,
    pub message: String,
    pub command_id: String,
    pub command_name: String,
    pub details: Option<Value>,
}

impl CommandError {
    pub fn new(
        kind: CommandErrorKind,
        message: impl Into<String>,
        command_id: impl Into<String>,
        command_name: impl Into<String>,
    ) -> Self {
        CommandError {
            kind,
            message: message.into(),
            command_id: command_id.into(),
            command_name: command_name.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Deadline expiry failure for a pending command.
    pub fn timeout(command_id: &str, command_name: &str, timeout_ms: u64) -> Self {
        CommandError::new(
            CommandErrorKind::Timeout,
            format!("no result within {timeout_ms} ms"),
            command_id,
            command_name,
        )
        .with_details(serde_json::json!({ "timeoutMs": timeout_ms }))
    }

    /// Transport-gone failure for a pending command.
    pub fn disconnected(command_id: &str, command_name: &str) -> Self {
        CommandError::new(
            CommandErrorKind::Disconnected,
            "transport disconnected",
            command_id,
            command_name,
        )
    }
}
