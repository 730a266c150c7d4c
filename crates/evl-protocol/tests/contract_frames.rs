/// Contract golden tests: decode each literal wire example, check the fields
/// a peer relies on, serialize back, and verify round-trip fidelity against
/// the original JSON.
use evl_protocol::{Frame, FrameBody, decode_frame, encode_frame, error_codes};

/// Helper: decode a literal example and assert byte-level round-trip
/// equivalence (as JSON values, so key order is irrelevant).
///
/// Returns the decoded frame so callers can inspect fields.
fn round_trip(json_text: &str) -> Frame {
    let frame = decode_frame(json_text)
        .unwrap_or_else(|e| panic!("failed to decode example: {e}\nJSON: {json_text}"));
    let serialized = encode_frame(&frame).expect("encode");

    let original: serde_json::Value = serde_json::from_str(json_text).unwrap();
    let reencoded: serde_json::Value = serde_json::from_str(&serialized).unwrap();
    assert_eq!(original, reencoded, "round-trip mismatch");
    frame
}

#[test]
fn command_frame_round_trip() {
    let frame = round_trip(
        r#"{
            "id": "c1",
            "type": "command",
            "timestamp": "2026-08-01T00:00:00Z",
            "aggregate": {
                "position": { "streamId": "user-1", "eventNumber": 0 },
                "name": "User"
            },
            "commandName": "CreateUser",
            "payload": { "name": "Ada" }
        }"#,
    );
    match frame.body {
        FrameBody::Command(body) => {
            assert_eq!(body.aggregate.name, "User");
            assert_eq!(body.aggregate.position.stream_id, "user-1");
            assert_eq!(body.aggregate.position.event_number, 0);
            assert_eq!(body.command_name, "CreateUser");
            assert_eq!(body.payload["name"], "Ada");
            assert_eq!(body.expected_version, None);
        }
        other => panic!("expected command, got {other:?}"),
    }
}

#[test]
fn successful_command_result_round_trip() {
    let frame = round_trip(
        r#"{
            "id": "c1",
            "type": "command_result",
            "timestamp": "2026-08-01T00:00:01Z",
            "success": true,
            "position": { "streamId": "user-1", "eventNumber": 1 }
        }"#,
    );
    assert_eq!(frame.id, "c1");
    match frame.body {
        FrameBody::CommandResult(body) => {
            assert!(body.success);
            let position = body.position.expect("position");
            assert_eq!(position.stream_id, "user-1");
            assert_eq!(position.event_number, 1);
            assert!(body.error.is_none());
        }
        other => panic!("expected command_result, got {other:?}"),
    }
}

#[test]
fn failed_command_result_round_trip() {
    let frame = round_trip(
        r#"{
            "id": "c2",
            "type": "command_result",
            "timestamp": "2026-08-01T00:00:02Z",
            "success": false,
            "error": { "code": "ConcurrencyConflict", "message": "expected 0, actual 1" }
        }"#,
    );
    match frame.body {
        FrameBody::CommandResult(body) => {
            assert!(!body.success);
            let error = body.error.expect("error");
            assert_eq!(error.code.as_deref(), Some(error_codes::CONCURRENCY_CONFLICT));
            assert_eq!(error.message, "expected 0, actual 1");
        }
        other => panic!("expected command_result, got {other:?}"),
    }
}

#[test]
fn event_frame_round_trip() {
    let frame = round_trip(
        r#"{
            "id": "e9",
            "type": "event",
            "timestamp": "2026-08-01T00:00:03Z",
            "streamId": "user-1",
            "eventNumber": 0,
            "position": 42,
            "eventType": "UserCreated",
            "event": { "name": "Ada" }
        }"#,
    );
    match frame.body {
        FrameBody::Event(body) => {
            assert_eq!(body.stream_id, "user-1");
            assert_eq!(body.event_number, 0);
            assert_eq!(body.position, 42);
            assert_eq!(body.event_type, "UserCreated");
            assert_eq!(body.event["name"], "Ada");
        }
        other => panic!("expected event, got {other:?}"),
    }
}

#[test]
fn subscription_ack_round_trip() {
    let frame = round_trip(
        r#"{
            "id": "a3",
            "type": "subscription_ack",
            "timestamp": "2026-08-01T00:00:04Z",
            "streamId": "room-1",
            "currentPosition": { "streamId": "room-1", "eventNumber": 7 },
            "isLive": true
        }"#,
    );
    match frame.body {
        FrameBody::SubscriptionAck(body) => {
            assert_eq!(body.stream_id, "room-1");
            assert_eq!(body.current_position.event_number, 7);
            assert!(body.is_live);
        }
        other => panic!("expected subscription_ack, got {other:?}"),
    }
}

#[test]
fn error_frame_with_correlation_round_trip() {
    let frame = round_trip(
        r#"{
            "id": "x1",
            "type": "error",
            "timestamp": "2026-08-01T00:00:05Z",
            "correlationId": "c7",
            "error": { "message": "unsupported", "code": "Protocol" }
        }"#,
    );
    assert_eq!(frame.correlation_id.as_deref(), Some("c7"));
    match frame.body {
        FrameBody::Error(body) => {
            assert_eq!(body.error.code.as_deref(), Some(error_codes::PROTOCOL));
        }
        other => panic!("expected error, got {other:?}"),
    }
}

#[test]
fn ping_and_pong_round_trip() {
    let ping = round_trip(
        r#"{ "id": "p1", "type": "ping", "timestamp": "2026-08-01T00:00:06Z" }"#,
    );
    assert_eq!(ping.body, FrameBody::Ping);
    let pong = round_trip(
        r#"{ "id": "p1", "type": "pong", "timestamp": "2026-08-01T00:00:06Z" }"#,
    );
    assert_eq!(pong.body, FrameBody::Pong);
    // The pong echoes the ping's id.
    assert_eq!(ping.id, pong.id);
}
