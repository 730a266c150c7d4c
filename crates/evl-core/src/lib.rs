//! Core domain model for the event sourcing session protocol: stream
//! identities and positions, the event store port with its embedded
//! backends, and the in-process event bus.

pub mod bus;
pub mod command;
pub mod store;
pub mod types;

pub use bus::{BusSubscription, EventBus};
pub use command::{Command, CommandError, CommandErrorKind, CommandResult};
pub use store::memory::MemoryEventStore;
pub use store::sqlite::SqliteEventStore;
pub use store::{EventStore, EventStoreError};
pub use types::{EventNumber, EventPayload, InvalidStreamId, RecordedEvent, StreamId, StreamPosition};
