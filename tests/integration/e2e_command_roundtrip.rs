//! End-to-end command round trips over a loopback transport and an
//! in-memory store: the success path, the optimistic-conflict path, the
//! dispatcher error taxonomy, and timeout/disconnect behavior.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use evl_client::{ClientConfig, EventClient};
use evl_core::command::{Command, CommandErrorKind};
use evl_core::store::EventStore;
use evl_core::types::{StreamId, StreamPosition};
use evl_test_utils::{LoopbackHarness, counter_aggregate, failing_aggregate, user_aggregate};
use evl_transport::loopback_pair;

fn stream(id: &str) -> StreamId {
    StreamId::new(id).unwrap()
}

fn create_user(id: &str) -> Command {
    Command::new("User", stream("user-1"), "CreateUser", json!({"name": "Ada"})).with_id(id)
}

#[tokio::test]
async fn create_user_commits_and_returns_the_position() {
    let harness = LoopbackHarness::start(vec![user_aggregate()]);

    let position = harness.client.send_command(create_user("c1")).await.unwrap();
    assert_eq!(position, StreamPosition::new(stream("user-1"), 1));

    // The committed event is readable at event number 0.
    let head = harness.store.head(&stream("user-1")).await.unwrap();
    assert_eq!(head.event_number, 1);
}

#[tokio::test]
async fn stale_expected_version_is_a_concurrency_conflict() {
    let harness = LoopbackHarness::start(vec![user_aggregate()]);
    harness.client.send_command(create_user("c1")).await.unwrap();

    // Same expected version again: the stream moved on.
    let command = Command::new("User", stream("user-1"), "Rename", json!({"name": "A"}))
        .with_id("c2")
        .expected(0);
    let err = harness.client.send_command(command).await.unwrap_err();
    assert_eq!(err.kind, CommandErrorKind::ConcurrencyConflict);
    assert_eq!(err.message, "expected 0, actual 1");
    assert_eq!(err.command_id, "c2");
}

#[tokio::test]
async fn unknown_command_is_handler_not_found() {
    let harness = LoopbackHarness::start(vec![user_aggregate()]);

    let command =
        Command::new("User", stream("user-1"), "Teleport", json!({})).with_id("c1");
    let err = harness.client.send_command(command).await.unwrap_err();
    assert_eq!(err.kind, CommandErrorKind::HandlerNotFound);
}

#[tokio::test]
async fn handler_domain_error_is_execution_error() {
    let harness = LoopbackHarness::start(vec![failing_aggregate()]);

    let command =
        Command::new("Broken", stream("b-1"), "AlwaysFail", json!({})).with_id("c1");
    let err = harness.client.send_command(command).await.unwrap_err();
    assert_eq!(err.kind, CommandErrorKind::ExecutionError);
    assert_eq!(err.message, "this command never succeeds");
}

#[tokio::test]
async fn empty_handler_output_succeeds_without_committing() {
    let harness = LoopbackHarness::start(vec![user_aggregate()]);
    harness.client.send_command(create_user("c1")).await.unwrap();

    let command = Command::new("User", stream("user-1"), "Touch", json!({}))
        .with_id("c2")
        .expected(1);
    let position = harness.client.send_command(command).await.unwrap();
    assert_eq!(position.event_number, 1);
    assert_eq!(harness.store.committed_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn unanswered_command_times_out_with_the_configured_deadline() {
    // A server that never answers: the peer side of the pair is simply
    // never served.
    let (client_side, _server_side) = loopback_pair();
    let client = EventClient::with_config(
        Arc::new(client_side),
        ClientConfig {
            command_timeout: Duration::from_secs(10),
        },
    );

    let err = client.send_command(create_user("c3")).await.unwrap_err();
    assert_eq!(err.kind, CommandErrorKind::Timeout);
    assert_eq!(err.command_id, "c3");
    assert_eq!(err.details, Some(json!({"timeoutMs": 10_000})));
}

#[tokio::test]
async fn concurrent_commands_each_get_exactly_one_result() {
    let harness = Arc::new(LoopbackHarness::start(vec![counter_aggregate()]));

    let mut tasks = Vec::new();
    for n in 0..20 {
        let harness = harness.clone();
        tasks.push(tokio::spawn(async move {
            let command = Command::new(
                "Counter",
                stream(&format!("counter-{n}")),
                "Increment",
                json!({}),
            );
            harness.client.send_command(command).await
        }));
    }

    for task in tasks {
        let result = task.await.unwrap();
        // One terminal result per command, and each one succeeded.
        assert_eq!(result.unwrap().event_number, 1);
    }
    assert_eq!(harness.store.committed_count(), 20);
}

#[tokio::test]
async fn command_round_trip_over_tcp() {
    use evl_core::store::memory::MemoryEventStore;
    use evl_server::{Dispatcher, SessionHost};
    use evl_transport::{TcpListenerTransport, TcpTransport};

    let store = Arc::new(MemoryEventStore::new());
    let dispatcher = Dispatcher::new(store.clone()).register(user_aggregate());
    let host = SessionHost::new(store, dispatcher);
    let listener = TcpListenerTransport::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().to_string();
    tokio::spawn(async move { host.serve(listener).await });

    let transport = TcpTransport::connect(&addr).await.unwrap();
    let client = EventClient::connect(Arc::new(transport));
    let position = client.send_command(create_user("c1")).await.unwrap();
    assert_eq!(position, StreamPosition::new(stream("user-1"), 1));
}

#[tokio::test]
async fn sequential_commands_advance_one_stream_without_gaps() {
    let harness = LoopbackHarness::start(vec![counter_aggregate()]);

    for n in 0..50u64 {
        let command = Command::new("Counter", stream("counter-1"), "Increment", json!({}))
            .expected(n);
        let position = harness.client.send_command(command).await.unwrap();
        assert_eq!(position.event_number, n + 1);
    }

    use futures_util::StreamExt;
    let events: Vec<_> = harness
        .store
        .read(StreamPosition::start(stream("counter-1")))
        .collect::<Vec<_>>()
        .await;
    let numbers: Vec<u64> = events
        .into_iter()
        .map(|e| e.unwrap().event_number)
        .collect();
    assert_eq!(numbers, (0..50).collect::<Vec<u64>>());
}
