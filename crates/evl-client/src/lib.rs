//! Client-side protocol state machine: command correlation with deadlines,
//! the subscription registry, and the inbound frame router.
//!
//! One [`EventClient`] owns one transport connection.  Commands await a
//! single terminal [`CommandResult`]; subscriptions are live streams of
//! events for one stream id.  Every pending operation resolves when the
//! transport goes away.

mod client;
mod subscription;

pub use client::{ClientConfig, EventClient, SubscribeError};
pub use subscription::Subscription;
