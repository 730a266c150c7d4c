//! Cross-component invariant checks: gap-free streams, append atomicity,
//! bus fan-out completeness, and durable-store parity for the broker's
//! sqlite backend.

use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::json;

use evl_core::bus::EventBus;
use evl_core::store::memory::MemoryEventStore;
use evl_core::store::sqlite::SqliteEventStore;
use evl_core::store::{EventStore, EventStoreError};
use evl_core::types::{EventPayload, StreamId, StreamPosition};

fn stream(id: &str) -> StreamId {
    StreamId::new(id).unwrap()
}

fn payload(event_type: &str) -> EventPayload {
    EventPayload::new(event_type, json!({}))
}

/// Read all of `stream_id` and assert its event numbers are 0..n with no
/// gaps.
async fn assert_gap_free(store: &dyn EventStore, stream_id: &StreamId) -> u64 {
    let events: Vec<_> = store
        .read(StreamPosition::start(stream_id.clone()))
        .collect::<Vec<_>>()
        .await;
    let mut expected = 0u64;
    for event in events {
        let event = event.unwrap();
        assert_eq!(
            event.event_number, expected,
            "gap in {stream_id} at {expected}"
        );
        expected += 1;
    }
    expected
}

#[tokio::test]
async fn concurrent_writers_to_distinct_streams_leave_no_gaps() {
    let store = Arc::new(MemoryEventStore::new());

    let mut tasks = Vec::new();
    for writer in 0..8 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            let id = stream(&format!("w-{writer}"));
            for n in 0..25u64 {
                store
                    .append(StreamPosition::new(id.clone(), n), vec![payload("E")])
                    .await
                    .unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    for writer in 0..8 {
        let length = assert_gap_free(store.as_ref(), &stream(&format!("w-{writer}"))).await;
        assert_eq!(length, 25);
    }
}

#[tokio::test]
async fn racing_writers_on_one_stream_commit_exactly_one_batch_per_slot() {
    let store = Arc::new(MemoryEventStore::new());

    // Both racers try to append at slot 0; exactly one wins.
    let first = store.append(StreamPosition::start(stream("s")), vec![payload("A")]);
    let second = store.append(StreamPosition::start(stream("s")), vec![payload("B")]);
    let (first, second) = tokio::join!(first, second);
    assert_eq!(
        [first.is_ok(), second.is_ok()].iter().filter(|ok| **ok).count(),
        1,
        "exactly one racer must win slot 0"
    );
    assert_eq!(assert_gap_free(store.as_ref(), &stream("s")).await, 1);
}

#[tokio::test]
async fn append_at_zero_on_an_existing_stream_conflicts() {
    let store = MemoryEventStore::new();
    store
        .append(
            StreamPosition::start(stream("s")),
            vec![payload("A"), payload("B")],
        )
        .await
        .unwrap();

    let err = store
        .append(StreamPosition::start(stream("s")), vec![payload("C")])
        .await
        .unwrap_err();
    assert_eq!(
        err,
        EventStoreError::ConcurrencyConflict {
            stream_id: stream("s"),
            expected: 0,
            actual: 2,
        }
    );
}

#[tokio::test]
async fn batch_append_is_atomic_under_conflict() {
    let store = MemoryEventStore::new();
    store
        .append(StreamPosition::start(stream("s")), vec![payload("A")])
        .await
        .unwrap();

    // A conflicting three-event batch commits nothing at all.
    let err = store
        .append(
            StreamPosition::start(stream("s")),
            vec![payload("X"), payload("Y"), payload("Z")],
        )
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(assert_gap_free(&store, &stream("s")).await, 1);
}

#[tokio::test]
async fn every_accepting_bus_subscriber_eventually_sees_every_event() {
    let store = MemoryEventStore::new();
    let bus = EventBus::start(store.subscribe_all());

    let mut all_subscribers: Vec<_> = (0..5).map(|_| bus.subscribe(|_| true)).collect();
    let mut odd_only = bus.subscribe(|e| e.event_number % 2 == 1);

    for n in 0..10u64 {
        store
            .append(StreamPosition::new(stream("s"), n), vec![payload("E")])
            .await
            .unwrap();
    }

    for subscriber in &mut all_subscribers {
        for expected in 0..10u64 {
            let event = subscriber.next().await.unwrap();
            assert_eq!(event.event_number, expected);
        }
    }
    for expected in [1u64, 3, 5, 7, 9] {
        assert_eq!(odd_only.next().await.unwrap().event_number, expected);
    }
}

#[tokio::test]
async fn sqlite_and_memory_backends_agree_on_the_append_contract() {
    let dir = tempfile::tempdir().unwrap();
    let sqlite = SqliteEventStore::open(&dir.path().join("events.db")).unwrap();
    let memory = MemoryEventStore::new();
    let stores: [&dyn EventStore; 2] = [&sqlite, &memory];

    for store in stores {
        let next = store
            .append(
                StreamPosition::start(stream("s")),
                vec![payload("A"), payload("B")],
            )
            .await
            .unwrap();
        assert_eq!(next.event_number, 2);

        let err = store
            .append(StreamPosition::new(stream("s"), 1), vec![payload("C")])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EventStoreError::ConcurrencyConflict {
                expected: 1,
                actual: 2,
                ..
            }
        ));

        assert_eq!(assert_gap_free(store, &stream("s")).await, 2);
        assert_eq!(store.head(&stream("s")).await.unwrap().event_number, 2);
    }
}
