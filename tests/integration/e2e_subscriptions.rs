//! End-to-end subscription behavior over loopback + memory store:
//! live-only delivery, per-stream isolation and ordering, unsubscribe, and
//! multi-client fan-out.

use std::time::Duration;

use serde_json::json;

use evl_core::command::Command;
use evl_core::types::StreamId;
use evl_test_utils::{LoopbackHarness, collect_events, expect_silence, user_aggregate};

fn stream(id: &str) -> StreamId {
    StreamId::new(id).unwrap()
}

/// Commit one event to `target` via the command path.
async fn commit(client: &evl_client::EventClient, target: &str, name: &str, expected: u64) {
    let command_name = if expected == 0 { "CreateUser" } else { "Rename" };
    let command = Command::new(
        "User",
        stream(target),
        command_name,
        json!({ "name": name }),
    )
    .expected(expected);
    client.send_command(command).await.unwrap();
}

#[tokio::test]
async fn subscription_is_live_only() {
    let harness = LoopbackHarness::start(vec![user_aggregate()]);

    // Event A committed before the subscription exists; let the bus pump
    // finish fanning it out before subscribing.
    commit(&harness.client, "room-1", "A", 0).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut subscription = harness
        .client
        .subscribe(stream("room-1"), None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Event B committed after.
    commit(&harness.client, "room-1", "B", 1).await;

    let events = collect_events(&mut subscription, 1).await;
    assert_eq!(events[0].payload.data["name"], "B");
    assert_eq!(events[0].event_number, 1);
    // A is never delivered through the live-only path.
    expect_silence(&mut subscription, Duration::from_millis(50)).await;
}

#[tokio::test]
async fn subscription_only_sees_its_stream_in_commit_order() {
    let harness = LoopbackHarness::start(vec![user_aggregate()]);
    let mut subscription = harness
        .client
        .subscribe(stream("room-1"), None)
        .await
        .unwrap();

    commit(&harness.client, "room-1", "one", 0).await;
    commit(&harness.client, "room-2", "noise", 0).await;
    commit(&harness.client, "room-1", "two", 1).await;
    commit(&harness.client, "room-2", "noise", 1).await;
    commit(&harness.client, "room-1", "three", 2).await;

    let events = collect_events(&mut subscription, 3).await;
    for event in &events {
        assert_eq!(event.stream_id, stream("room-1"));
    }
    let numbers: Vec<u64> = events.iter().map(|e| e.event_number).collect();
    assert_eq!(numbers, vec![0, 1, 2]);
    let names: Vec<&str> = events
        .iter()
        .map(|e| e.payload.data["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["one", "two", "three"]);

    expect_silence(&mut subscription, Duration::from_millis(50)).await;
}

#[tokio::test]
async fn from_position_subscription_catches_up_then_goes_live() {
    let harness = LoopbackHarness::start(vec![user_aggregate()]);

    commit(&harness.client, "room-1", "A", 0).await;
    commit(&harness.client, "room-1", "B", 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Subscribing from position 0 replays the persisted tail first.
    let mut subscription = harness
        .client
        .subscribe(stream("room-1"), Some(0))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    commit(&harness.client, "room-1", "C", 2).await;

    let events = collect_events(&mut subscription, 3).await;
    let names: Vec<&str> = events
        .iter()
        .map(|e| e.payload.data["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["A", "B", "C"]);
    let numbers: Vec<u64> = events.iter().map(|e| e.event_number).collect();
    assert_eq!(numbers, vec![0, 1, 2]);
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let harness = LoopbackHarness::start(vec![user_aggregate()]);
    let mut subscription = harness
        .client
        .subscribe(stream("room-1"), None)
        .await
        .unwrap();

    commit(&harness.client, "room-1", "A", 0).await;
    let _ = collect_events(&mut subscription, 1).await;

    harness.client.unsubscribe(&stream("room-1")).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    commit(&harness.client, "room-1", "B", 1).await;
    // The local queue was closed by unsubscribe; nothing more arrives.
    let next =
        tokio::time::timeout(Duration::from_millis(100), futures_util::StreamExt::next(&mut subscription))
            .await;
    assert!(matches!(next, Ok(None)), "subscription must have ended");
}

#[tokio::test]
async fn events_fan_out_to_every_subscribed_client() {
    let harness = LoopbackHarness::start(vec![user_aggregate()]);
    let second_client = harness.connect_client();

    let mut first = harness
        .client
        .subscribe(stream("room-1"), None)
        .await
        .unwrap();
    let mut second = second_client
        .subscribe(stream("room-1"), None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    commit(&harness.client, "room-1", "A", 0).await;

    let first_events = collect_events(&mut first, 1).await;
    let second_events = collect_events(&mut second, 1).await;
    assert_eq!(first_events[0].payload.data["name"], "A");
    assert_eq!(second_events[0].payload.data["name"], "A");
}

#[tokio::test]
async fn writer_without_subscription_receives_nothing() {
    let harness = LoopbackHarness::start(vec![user_aggregate()]);
    let subscriber_client = harness.connect_client();

    let mut subscription = subscriber_client
        .subscribe(stream("room-1"), None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    // harness.client writes but never subscribed; only the subscriber
    // observes the event.
    commit(&harness.client, "room-1", "A", 0).await;
    let events = collect_events(&mut subscription, 1).await;
    assert_eq!(events[0].event_number, 0);
}

#[tokio::test]
async fn dropping_the_subscription_handle_cleans_up_server_side() {
    let harness = LoopbackHarness::start(vec![user_aggregate()]);

    let subscription = harness
        .client
        .subscribe(stream("room-1"), None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    drop(subscription);
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Committing after the drop must not wedge anything; a fresh
    // subscription still works end to end.
    commit(&harness.client, "room-1", "A", 0).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    let mut fresh = harness
        .client
        .subscribe(stream("room-1"), None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    commit(&harness.client, "room-1", "B", 1).await;

    let events = collect_events(&mut fresh, 1).await;
    assert_eq!(events[0].payload.data["name"], "B");
}
