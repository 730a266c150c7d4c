//! Eventline: a transport-agnostic event sourcing protocol core.
//!
//! Facade re-exports for embedders; the functionality lives in the
//! workspace crates.

pub use evl_client as client;
pub use evl_core as domain;
pub use evl_protocol as protocol;
pub use evl_server as server;
pub use evl_transport as transport;
