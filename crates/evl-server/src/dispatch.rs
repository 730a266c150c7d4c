//! Command dispatcher: route a wire command to its aggregate handler, then
//! load -> execute -> commit against the event store.
//!
//! Event delivery to subscribers happens exclusively through the store's
//! `subscribe_all` feeding the bus; the dispatcher never publishes
//! directly.

use std::sync::Arc;

use futures::StreamExt;
use tracing::debug;

use crate::aggregate::{AggregateDefinition, CommandContext};
use crate::connection::WireCommand;
use evl_core::command::{CommandError, CommandErrorKind, CommandResult};
use evl_core::store::{EventStore, EventStoreError};
use evl_core::types::{RecordedEvent, StreamPosition};

/// Dispatch tuning knobs.
#[derive(Debug, Clone, Default)]
pub struct DispatcherConfig {
    /// How many times an append-time concurrency race may be retried by
    /// reloading.  The default of 0 surfaces the first conflict.
    pub conflict_retries: u32,
}

/// Routes commands to aggregate handlers and commits their output.
pub struct Dispatcher {
    aggregates: Vec<AggregateDefinition>,
    store: Arc<dyn EventStore>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Dispatcher {
            aggregates: Vec::new(),
            store,
            config: DispatcherConfig::default(),
        }
    }

    pub fn with_config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Add an aggregate.  Handler lookup is first-match in registration
    /// order.
    pub fn register(mut self, aggregate: AggregateDefinition) -> Self {
        self.aggregates.push(aggregate);
        self
    }

    /// Run one command through load -> execute -> commit.
    ///
    /// Always terminates in exactly one [`CommandResult`]; every failure
    /// mode maps to a distinct error kind.
    pub async fn dispatch(&self, command: &WireCommand) -> CommandResult {
        let Some(handler) = self
            .aggregates
            .iter()
            .find_map(|aggregate| aggregate.handler(&command.name))
        else {
            return Err(CommandError::new(
                CommandErrorKind::HandlerNotFound,
                format!("no aggregate handles {}", command.name),
                &command.command_id,
                &command.name,
            ));
        };

        let mut retries_left = self.config.conflict_retries;
        let mut first_attempt = true;
        loop {
            // Load.
            let prior = match self.load(command).await {
                Ok(prior) => prior,
                Err(failure) => return Err(failure),
            };
            let loaded = StreamPosition::new(command.target.clone(), prior.len() as u64);

            // The sender's expectation is judged against the first load;
            // a stale view is a conflict no amount of retrying repairs.
            if first_attempt && command.expected != loaded.event_number {
                return Err(conflict_failure(command, command.expected, loaded.event_number));
            }
            first_attempt = false;

            // Execute.
            let context = CommandContext {
                target: command.target.clone(),
                payload: command.payload.clone(),
                metadata: command.metadata.clone(),
                prior,
            };
            let events = match handler(&context) {
                Ok(events) => events,
                Err(domain) => {
                    let mut failure = CommandError::new(
                        CommandErrorKind::ExecutionError,
                        domain.message,
                        &command.command_id,
                        &command.name,
                    );
                    failure.details = domain.details;
                    return Err(failure);
                }
            };

            // Nothing to commit: success at the loaded position.
            if events.is_empty() {
                return Ok(loaded);
            }

            // Commit.
            match self.store.append(loaded.clone(), events).await {
                Ok(next) => return Ok(next),
                Err(EventStoreError::ConcurrencyConflict {
                    expected, actual, ..
                }) => {
                    if retries_left == 0 {
                        return Err(conflict_failure(command, expected, actual));
                    }
                    retries_left -= 1;
                    debug!(
                        command_id = %command.command_id,
                        retries_left,
                        "append raced with another writer; reloading"
                    );
                }
                Err(e) => {
                    return Err(store_failure(command, &e));
                }
            }
        }
    }

    async fn load(&self, command: &WireCommand) -> Result<Vec<RecordedEvent>, CommandError> {
        let mut events = self
            .store
            .read(StreamPosition::start(command.target.clone()));
        let mut prior = Vec::new();
        while let Some(event) = events.next().await {
            match event {
                Ok(event) => prior.push(event),
                Err(e) => return Err(store_failure(command, &e)),
            }
        }
        Ok(prior)
    }
}

fn conflict_failure(command: &WireCommand, expected: u64, actual: u64) -> CommandError {
    CommandError::new(
        CommandErrorKind::ConcurrencyConflict,
        format!("expected {expected}, actual {actual}"),
        &command.command_id,
        &command.name,
    )
    .with_details(serde_json::json!({
        "streamId": command.target.to_string(),
        "expected": expected,
        "actual": actual,
    }))
}

fn store_failure(command: &WireCommand, error: &EventStoreError) -> CommandError {
    CommandError::new(
        CommandErrorKind::StoreError,
        error.to_string(),
        &command.command_id,
        &command.name,
    )
}
