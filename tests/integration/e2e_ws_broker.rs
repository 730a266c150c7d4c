//! End-to-end over a real WebSocket: an in-process broker serving the
//! session protocol, driven by the client crate's WS transport and by a raw
//! socket for malformed-input checks.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::tungstenite::protocol::Message;

use broker::{Broker, parse_config};
use evl_client::EventClient;
use evl_core::command::Command;
use evl_core::types::{StreamId, StreamPosition};
use evl_test_utils::{collect_events, user_aggregate};
use evl_transport::{MessageTransport, WsTransport};

fn stream(id: &str) -> StreamId {
    StreamId::new(id).unwrap()
}

/// Spin up an in-process broker on an ephemeral port.
/// Returns the `ws://` URL of the session endpoint.
async fn start_broker() -> String {
    start_broker_with("schema_version = 1\n").await
}

async fn start_broker_with(config_text: &str) -> String {
    let config = parse_config(config_text).unwrap();
    let (_state, router) = Broker::new(config)
        .with_aggregate(user_aggregate())
        .build()
        .unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind broker");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("broker error");
    });
    // Give the broker a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(20)).await;
    format!("ws://{addr}/ws/v1/sessions")
}

#[tokio::test]
async fn command_and_subscription_round_trip_over_websocket() {
    let url = start_broker().await;

    let subscriber_transport = WsTransport::connect(&url).await.unwrap();
    let subscriber = EventClient::connect(Arc::new(subscriber_transport));
    let mut subscription = subscriber.subscribe(stream("user-1"), None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let writer_transport = WsTransport::connect(&url).await.unwrap();
    let writer = EventClient::connect(Arc::new(writer_transport));

    let command = Command::new("User", stream("user-1"), "CreateUser", json!({"name": "Ada"}))
        .with_id("c1");
    let position = writer.send_command(command).await.unwrap();
    assert_eq!(position, StreamPosition::new(stream("user-1"), 1));

    let events = collect_events(&mut subscription, 1).await;
    assert_eq!(events[0].stream_id, stream("user-1"));
    assert_eq!(events[0].event_number, 0);
    assert_eq!(events[0].payload.event_type, "UserCreated");
    assert_eq!(events[0].payload.data["name"], "Ada");
}

#[tokio::test]
async fn server_disconnect_fails_pending_work() {
    let url = start_broker().await;
    let transport = Arc::new(WsTransport::connect(&url).await.unwrap());
    let client = EventClient::connect(transport.clone());

    let mut subscription = client.subscribe(stream("room-1"), None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    transport.close().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The subscription ends and new commands fail fast.
    assert_eq!(subscription.next().await, None);
    let err = client
        .send_command(Command::new("User", stream("u"), "CreateUser", json!({})))
        .await
        .unwrap_err();
    assert_eq!(err.kind, evl_core::command::CommandErrorKind::Disconnected);
}

#[tokio::test]
async fn malformed_frames_on_a_raw_socket_do_not_kill_the_session() {
    let url = start_broker().await;
    let (mut socket, _response) = tokio_tungstenite::connect_async(&url).await.unwrap();

    // Garbage first, then a well-formed command on the same socket.
    socket
        .send(Message::Text("invalid json {".into()))
        .await
        .unwrap();
    let command = json!({
        "id": "c1",
        "type": "command",
        "timestamp": "2026-08-01T00:00:00Z",
        "aggregate": {
            "position": { "streamId": "user-1", "eventNumber": 0 },
            "name": "User"
        },
        "commandName": "CreateUser",
        "payload": { "name": "Ada" }
    });
    socket
        .send(Message::Text(command.to_string().into()))
        .await
        .unwrap();

    // Skip the courtesy decode-error frame, then expect the result.
    let deadline = Duration::from_secs(5);
    let result = loop {
        let msg = tokio::time::timeout(deadline, socket.next())
            .await
            .expect("server reply expected")
            .expect("socket open")
            .expect("socket healthy");
        let Message::Text(text) = msg else { continue };
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        if value["type"] == "command_result" {
            break value;
        }
    };
    assert_eq!(result["id"], "c1");
    assert_eq!(result["success"], true);
    assert_eq!(result["position"]["streamId"], "user-1");
    assert_eq!(result["position"]["eventNumber"], 1);
}

#[tokio::test]
async fn sqlite_backend_persists_across_broker_instances() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("events.db");
    let config = format!(
        "schema_version = 1\n[store]\nbackend = \"sqlite\"\nsqlite_path = \"{}\"\n",
        db_path.display()
    );

    let url = start_broker_with(&config).await;
    let client = EventClient::connect(Arc::new(WsTransport::connect(&url).await.unwrap()));
    client
        .send_command(
            Command::new("User", stream("user-1"), "CreateUser", json!({"name": "Ada"}))
                .with_id("c1"),
        )
        .await
        .unwrap();

    // A second broker over the same database file sees the committed
    // stream: a Rename at expected version 1 only succeeds if the first
    // commit was durable.
    let second_url = start_broker_with(&config).await;
    let second_client =
        EventClient::connect(Arc::new(WsTransport::connect(&second_url).await.unwrap()));
    let position = second_client
        .send_command(
            Command::new("User", stream("user-1"), "Rename", json!({"name": "Lovelace"}))
                .with_id("c2")
                .expected(1),
        )
        .await
        .unwrap();
    assert_eq!(position.event_number, 2);
}

#[tokio::test]
async fn healthz_answers() {
    let url = start_broker().await;
    // Derive the HTTP URL from the ws URL.
    let http = url
        .replace("ws://", "http://")
        .replace("/ws/v1/sessions", "/healthz");
    let body = reqwest::get(&http).await.unwrap().text().await.unwrap();
    assert_eq!(body, "ok");
}
