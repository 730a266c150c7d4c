//! Server-side protocol core: per-connection session state, the command
//! dispatcher, and the bridge that wires both to the event bus.

mod aggregate;
mod bridge;
mod connection;
mod dispatch;

pub use aggregate::{AggregateDefinition, CommandContext, HandlerError};
pub use bridge::{SessionHost, serve_session};
pub use connection::{ServerConnection, WireCommand};
pub use dispatch::{Dispatcher, DispatcherConfig};
