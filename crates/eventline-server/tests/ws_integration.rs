//! End-to-end WebSocket tests: real axum server on an ephemeral port,
//! real tokio-tungstenite clients.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use uuid::Uuid;

use eventline_protocol::EventKind;
use eventline_server::config::Settings;
use eventline_server::{app, build_state, AppState};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

const USER_TOKEN: &str = "user-secret";
const ADMIN_TOKEN: &str = "admin-secret";

async fn start_server() -> (String, Arc<AppState>) {
    let settings: Settings = serde_json::from_value(json!({
        "user_token": USER_TOKEN,
        "admin_token": ADMIN_TOKEN,
        "queue_capacity": 32,
    }))
    .expect("settings");

    let state = build_state(settings).await;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let router = app(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });

    (format!("ws://{}/ws/events", addr), state)
}

async fn connect(url: &str, token: &str) -> WsClient {
    let (stream, _) = connect_async(format!("{}?token={}", url, token))
        .await
        .expect("connect");
    stream
}

/// Read frames until the next text envelope, with a timeout.
async fn next_envelope(client: &mut WsClient) -> Value {
    timeout(Duration::from_secs(5), async {
        loop {
            match client.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str::<Value>(&text).expect("json envelope");
                }
                Some(Ok(_)) => continue,
                other => panic!("connection ended while waiting for envelope: {:?}", other),
            }
        }
    })
    .await
    .expect("timed out waiting for envelope")
}

async fn subscribe(client: &mut WsClient, topic: &str) {
    client
        .send(Message::Text(
            json!({ "op": "subscribe", "topic": topic }).to_string(),
        ))
        .await
        .expect("send subscribe");
    let ack = next_envelope(client).await;
    assert_eq!(ack["type"], "subscribed");
    assert_eq!(ack["data"]["topic"], topic);
}

#[tokio::test]
async fn subscriber_receives_ordered_envelopes() {
    let (url, state) = start_server().await;
    let conversation_id = Uuid::new_v4();
    let topic = format!("conversation:{}", conversation_id);

    let mut client = connect(&url, USER_TOKEN).await;
    subscribe(&mut client, &topic).await;

    state
        .bus
        .publish(
            EventKind::STREAM_START,
            json!({ "conversation_id": conversation_id }),
        )
        .await;
    for content in ["Hel", "lo"] {
        state
            .bus
            .publish(
                EventKind::STREAM_CHUNK,
                json!({ "conversation_id": conversation_id, "content": content }),
            )
            .await;
    }
    state
        .bus
        .publish(
            EventKind::STREAM_END,
            json!({ "conversation_id": conversation_id }),
        )
        .await;

    let mut last_sequence = -1i64;
    let expected_kinds = ["stream_start", "stream_chunk", "stream_chunk", "stream_end"];
    for expected in expected_kinds {
        let envelope = next_envelope(&mut client).await;
        assert_eq!(envelope["version"], 1);
        assert_eq!(envelope["type"], expected);
        assert_eq!(envelope["topic"], topic);
        let sequence = envelope["sequence"].as_i64().expect("sequence");
        assert!(sequence > last_sequence, "sequence must increase per topic");
        last_sequence = sequence;
    }
    assert_eq!(last_sequence, 3);
}

#[tokio::test]
async fn unauthorized_admin_subscribe_closes_with_4403() {
    let (url, state) = start_server().await;

    let mut client = connect(&url, USER_TOKEN).await;
    client
        .send(Message::Text(
            json!({ "op": "subscribe", "topic": "ops" }).to_string(),
        ))
        .await
        .expect("send subscribe");

    let close_code = timeout(Duration::from_secs(5), async {
        loop {
            match client.next().await {
                Some(Ok(Message::Close(Some(frame)))) => return Some(u16::from(frame.code)),
                Some(Ok(Message::Close(None))) | None => return None,
                Some(Ok(_)) => continue,
                Some(Err(_)) => return None,
            }
        }
    })
    .await
    .expect("timed out waiting for close");

    assert_eq!(close_code, Some(eventline_protocol::CLOSE_UNAUTHORIZED));
    assert_eq!(
        state
            .manager
            .subscriber_count(&eventline_protocol::Topic::Ops)
            .await,
        0
    );
}

#[tokio::test]
async fn admin_receives_ops_events() {
    let (url, state) = start_server().await;

    let mut client = connect(&url, ADMIN_TOKEN).await;
    subscribe(&mut client, "ops").await;

    state
        .bus
        .publish(EventKind::OPS_EVENT, json!({ "connections": 1 }))
        .await;

    let envelope = next_envelope(&mut client).await;
    assert_eq!(envelope["type"], "ops_event");
    assert_eq!(envelope["topic"], "ops");
    assert_eq!(envelope["sequence"], 0);
}

#[tokio::test]
async fn invalid_token_is_closed_immediately() {
    let (url, _state) = start_server().await;

    let (mut client, _) = connect_async(format!("{}?token=wrong", url))
        .await
        .expect("upgrade still succeeds");

    let outcome = timeout(Duration::from_secs(5), client.next())
        .await
        .expect("timed out");
    match outcome {
        Some(Ok(Message::Close(_))) | None => {}
        other => panic!("expected close, got {:?}", other),
    }
}

#[tokio::test]
async fn topics_are_isolated_between_clients() {
    let (url, state) = start_server().await;
    let conversation_a = Uuid::new_v4();
    let conversation_b = Uuid::new_v4();

    let mut client_a = connect(&url, USER_TOKEN).await;
    let mut client_b = connect(&url, USER_TOKEN).await;
    subscribe(&mut client_a, &format!("conversation:{}", conversation_a)).await;
    subscribe(&mut client_b, &format!("conversation:{}", conversation_b)).await;

    state
        .bus
        .publish(
            EventKind::STREAM_START,
            json!({ "conversation_id": conversation_a }),
        )
        .await;

    let envelope = next_envelope(&mut client_a).await;
    assert_eq!(envelope["type"], "stream_start");

    // Client B sees nothing for A's conversation.
    let nothing = timeout(Duration::from_millis(200), client_b.next()).await;
    assert!(nothing.is_err(), "client B received an unexpected frame");
}

#[tokio::test]
async fn malformed_frames_do_not_kill_the_connection() {
    let (url, state) = start_server().await;
    let conversation_id = Uuid::new_v4();
    let topic = format!("conversation:{}", conversation_id);

    let mut client = connect(&url, USER_TOKEN).await;
    client
        .send(Message::Text("this is not json".to_string()))
        .await
        .expect("send garbage");

    // Still able to subscribe and receive afterwards.
    subscribe(&mut client, &topic).await;
    state
        .bus
        .publish(
            EventKind::STREAM_START,
            json!({ "conversation_id": conversation_id }),
        )
        .await;
    let envelope = next_envelope(&mut client).await;
    assert_eq!(envelope["type"], "stream_start");
}
