//! WebSocket API for real-time envelope delivery.
//!
//! One route, `GET /ws/events`: token auth on upgrade, then a read half
//! handling client ops and a writer task draining the connection's bounded
//! outbound queue. All fan-out happens through the connection manager; the
//! socket loop never touches another connection.

use std::borrow::Cow;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use eventline_protocol::{ClientOp, Envelope, EventKind, Topic};

use crate::conn::{AuthLevel, CloseReason, Connection};
use crate::AppState;

/// WebSocket connection parameters
#[derive(Debug, Deserialize)]
pub struct WsParams {
    /// Optional token for authentication (prefer Authorization header)
    pub token: Option<String>,
}

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// GET /ws/events
/// Subscribe to real-time envelopes via WebSocket.
///
/// Authentication: Bearer token in the Authorization header, falling back
/// to a `token` query parameter. The admin token grants access to
/// admin-gated topics.
pub async fn ws_events(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
    Query(params): Query<WsParams>,
) -> Response {
    let bearer = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "));

    let token = match (bearer, params.token.as_deref()) {
        (Some(t), _) => Some(t),
        (None, Some(t)) => {
            warn!("WebSocket authenticated via query token; prefer Authorization header");
            Some(t)
        }
        (None, None) => None,
    };

    let auth = token.and_then(|t| {
        if t == state.settings.admin_token {
            Some(AuthLevel::Admin)
        } else if t == state.settings.user_token {
            Some(AuthLevel::User)
        } else {
            None
        }
    });

    if auth.is_none() {
        warn!("unauthorized WebSocket connection attempt");
        // WebSocketUpgrade doesn't support returning error responses easily;
        // the connection is upgraded and immediately closed.
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state, auth))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, auth: Option<AuthLevel>) {
    let Some(auth) = auth else {
        let (mut tx, _rx) = socket.split();
        let _ = tx.send(Message::Close(None)).await;
        return;
    };

    let conn = state.manager.register(auth).await;
    if !conn.set_open() {
        state.manager.remove(conn.id).await;
        return;
    }
    info!(conn_id = %conn.id, auth = ?auth, "WebSocket connection open");

    let (tx, mut rx) = socket.split();

    // Writer: single owner of the socket sink, drains the bounded queue.
    let writer_conn = conn.clone();
    let writer = tokio::spawn(async move { run_writer(tx, writer_conn).await });

    // Reader: client ops, heartbeat pongs, idle accounting.
    loop {
        tokio::select! {
            msg = rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        conn.touch();
                        if !handle_client_text(&state, &conn, &text).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(_)) | Ok(Message::Pong(_))) => {
                        conn.touch();
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(conn_id = %conn.id, "client sent close frame");
                        conn.begin_close(CloseReason::PeerGone);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(conn_id = %conn.id, error = %e, "WebSocket error");
                        conn.begin_close(CloseReason::PeerGone);
                        break;
                    }
                    None => {
                        debug!(conn_id = %conn.id, "client disconnected");
                        conn.begin_close(CloseReason::PeerGone);
                        break;
                    }
                }
            }
            // Server-side close (idle timeout, authorization failure).
            _ = conn.wait_closing() => break,
        }
    }

    // Teardown: drop from every index; the queue closes, the writer flushes
    // its backlog, sends the close frame and exits.
    state.manager.remove(conn.id).await;
    let _ = writer.await;
    info!(conn_id = %conn.id, "WebSocket connection closed");
}

async fn run_writer(mut tx: SplitSink<WebSocket, Message>, conn: Arc<Connection>) {
    while let Some(envelope) = conn.queue().pop().await {
        let json = match serde_json::to_string(&envelope) {
            Ok(json) => json,
            Err(e) => {
                warn!(conn_id = %conn.id, error = %e, "failed to serialize envelope");
                continue;
            }
        };
        if tx.send(Message::Text(json)).await.is_err() {
            // Fatal for this connection only.
            conn.begin_close(CloseReason::WriteError);
            return;
        }
    }

    let code = conn
        .close_reason()
        .map(CloseReason::close_code)
        .unwrap_or(1000);
    let _ = tx
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: Cow::from(""),
        })))
        .await;
}

/// Handle one text frame. Returns `false` when the connection must close.
async fn handle_client_text(state: &Arc<AppState>, conn: &Arc<Connection>, text: &str) -> bool {
    let op = match serde_json::from_str::<ClientOp>(text) {
        Ok(op) => op,
        Err(e) => {
            state.malformed_messages.fetch_add(1, Ordering::Relaxed);
            warn!(conn_id = %conn.id, error = %e, "malformed client message dropped");
            return true;
        }
    };

    match op {
        ClientOp::Subscribe { topic } => {
            let topic = match Topic::parse(&topic) {
                Ok(topic) => topic,
                Err(e) => {
                    state.malformed_messages.fetch_add(1, Ordering::Relaxed);
                    conn.queue().push(Envelope::control(
                        EventKind::ERROR,
                        json!({ "message": e.to_string() }),
                    ));
                    return true;
                }
            };
            match state.manager.subscribe(conn, topic.clone()).await {
                Ok(()) => {
                    conn.queue().push(Envelope::control(
                        EventKind::SUBSCRIBED,
                        json!({ "topic": topic.to_string() }),
                    ));
                    true
                }
                Err(e) => {
                    // Fatal: distinguishable close code, never silently ignored.
                    warn!(conn_id = %conn.id, error = %e, "closing connection");
                    conn.begin_close(CloseReason::Unauthorized);
                    false
                }
            }
        }
        ClientOp::Unsubscribe { topic } => {
            if let Ok(topic) = Topic::parse(&topic) {
                state.manager.unsubscribe(conn, &topic).await;
            }
            true
        }
        // touch() already reset the idle clock.
        ClientOp::Pong => true,
    }
}
