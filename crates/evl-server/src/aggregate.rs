//! Aggregate registration: a named set of command handlers over one stream.
//!
//! Handlers are pure with respect to the store: they see the loaded prior
//! events and the command payload, and return the events to commit.  The
//! dispatcher performs the load and the commit.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use evl_core::types::{EventNumber, EventPayload, RecordedEvent, StreamId};

/// What a handler sees: the target stream, the command payload, and the
/// stream's prior events as loaded at dispatch time.
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub target: StreamId,
    pub payload: Value,
    pub metadata: Option<serde_json::Map<String, Value>>,
    pub prior: Vec<RecordedEvent>,
}

impl CommandContext {
    /// The slot the first produced event would land in.
    pub fn next_event_number(&self) -> EventNumber {
        self.prior.len() as u64
    }

    /// True when the target stream did not exist at load time.
    pub fn is_new_stream(&self) -> bool {
        self.prior.is_empty()
    }
}

/// A domain error raised by a handler; surfaced as an `ExecutionError`
/// command failure with the handler-provided message.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    pub details: Option<Value>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        HandlerError {
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

pub(crate) type CommandHandler =
    Arc<dyn Fn(&CommandContext) -> Result<Vec<EventPayload>, HandlerError> + Send + Sync>;

/// An explicit `command name -> handler` table published at construction
/// time.  The dispatcher consults these tables in registration order.
pub struct AggregateDefinition {
    name: String,
    handlers: HashMap<String, CommandHandler>,
}

impl AggregateDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        AggregateDefinition {
            name: name.into(),
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for `command_name` (PascalCase selector).
    pub fn command<F>(mut self, command_name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&CommandContext) -> Result<Vec<EventPayload>, HandlerError> + Send + Sync + 'static,
    {
        self.handlers.insert(command_name.into(), Arc::new(handler));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handles(&self, command_name: &str) -> bool {
        self.handlers.contains_key(command_name)
    }

    pub(crate) fn handler(&self, command_name: &str) -> Option<&CommandHandler> {
        self.handlers.get(command_name)
    }
}

impl std::fmt::Debug for AggregateDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut commands: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        commands.sort_unstable();
        f.debug_struct("AggregateDefinition")
            .field("name", &self.name)
            .field("commands", &commands)
            .finish()
    }
}
