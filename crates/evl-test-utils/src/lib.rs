// evl-test-utils: in-process harnesses and fixtures for integration
// testing the protocol core without sockets or external services.

mod aggregates;
mod collect;
mod harness;

pub use aggregates::{counter_aggregate, failing_aggregate, user_aggregate};
pub use collect::{collect_events, expect_silence};
pub use harness::LoopbackHarness;
