use std::time::Duration;

use futures_util::{Stream, StreamExt};

use evl_core::types::RecordedEvent;

const COLLECT_DEADLINE: Duration = Duration::from_secs(5);

/// Take exactly `n` events; panics if the stream ends or stalls first.
pub async fn collect_events<S>(stream: &mut S, n: usize) -> Vec<RecordedEvent>
where
    S: Stream<Item = RecordedEvent> + Unpin,
{
    let mut events = Vec::with_capacity(n);
    for index in 0..n {
        let event = tokio::time::timeout(COLLECT_DEADLINE, stream.next())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for event {index}"))
            .unwrap_or_else(|| panic!("stream ended before event {index}"));
        events.push(event);
    }
    events
}

/// Assert nothing arrives on `stream` within `window`.
pub async fn expect_silence<S>(stream: &mut S, window: Duration)
where
    S: Stream<Item = RecordedEvent> + Unpin,
{
    if let Ok(Some(event)) = tokio::time::timeout(window, stream.next()).await {
        panic!(
            "expected silence but received {}@{}",
            event.stream_id, event.event_number
        );
    }
}
