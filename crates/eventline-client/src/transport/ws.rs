//! WebSocket driver for [`TransportCore`].
//!
//! Owns the socket and the reconnect loop; every state decision is made by
//! the core, the driver only executes the actions it hands back.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use eventline_protocol::{ClientOp, Envelope, EventKind, Topic, CLOSE_UNAUTHORIZED};

use crate::reducer::StreamReducer;
use crate::transport::{
    CloseDisposition, RetryAction, RetryPolicy, TransportCore, TransportError, TransportState,
};

type WsWriter = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<TcpStream>>,
    Message,
>;

/// Connection parameters for [`EventClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint, e.g. `ws://127.0.0.1:3000/ws/events`.
    pub url: String,
    pub token: String,
    /// Topics subscribed on every (re)connect.
    pub topics: Vec<Topic>,
    pub retry: RetryPolicy,
    pub queue_capacity: usize,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            topics: Vec::new(),
            retry: RetryPolicy::default(),
            queue_capacity: 256,
        }
    }
}

pub type EnvelopeHandler = Box<dyn Fn(&Envelope) + Send + Sync>;

/// How one established connection ended.
enum SessionEnd {
    /// Socket dropped or errored; the reconnect policy decides what next.
    Lost,
    /// User asked to close; the loop exits cleanly.
    Shutdown,
    /// Server rejected us with a policy close; retrying cannot help.
    Unauthorized,
}

pub struct EventClient {
    config: ClientConfig,
    core: Mutex<TransportCore>,
    reducer: Mutex<StreamReducer>,
    /// Wakes the writer when frames are queued while connected.
    send_notify: Notify,
    /// Wakes the run loop for a user close. The core's cancel flag is the
    /// source of truth; this only interrupts whatever the loop awaits.
    shutdown: Notify,
    on_envelope: EnvelopeHandler,
    malformed_frames: AtomicU64,
    /// True while `run` is executing. A dial queued with no driver alive
    /// cannot happen on its own; `send_op` reports it instead.
    driver_active: AtomicBool,
}

/// Clears the active flag on every exit path out of `run`.
struct DriverGuard<'a>(&'a AtomicBool);

impl Drop for DriverGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl EventClient {
    pub fn new(config: ClientConfig, on_envelope: EnvelopeHandler) -> Self {
        let core = TransportCore::new(config.retry.clone(), config.queue_capacity);
        Self {
            config,
            core: Mutex::new(core),
            reducer: Mutex::new(StreamReducer::new()),
            send_notify: Notify::new(),
            shutdown: Notify::new(),
            on_envelope,
            malformed_frames: AtomicU64::new(0),
            driver_active: AtomicBool::new(false),
        }
    }

    fn lock_core(&self) -> std::sync::MutexGuard<'_, TransportCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_reducer(&self) -> std::sync::MutexGuard<'_, StreamReducer> {
        self.reducer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> TransportState {
        self.lock_core().state()
    }

    /// Queue a subscribe op; flushed immediately when connected, on the
    /// next successful open otherwise.
    pub fn subscribe(&self, topic: &Topic) {
        self.send_op(&ClientOp::Subscribe {
            topic: topic.to_string(),
        });
    }

    pub fn unsubscribe(&self, topic: &Topic) {
        self.send_op(&ClientOp::Unsubscribe {
            topic: topic.to_string(),
        });
    }

    pub fn send_op(&self, op: &ClientOp) {
        match serde_json::to_string(op) {
            Ok(frame) => {
                let outcome = self.lock_core().send(frame);
                if outcome.evicted {
                    tracing::warn!("send queue full, dropped oldest queued frame");
                }
                if outcome.dial && !self.is_running() {
                    // The dial action needs a driver; the frame stays
                    // queued and the next `run` call flushes it.
                    tracing::warn!("no connection driver running, frame queued until run()");
                }
                self.send_notify.notify_one();
            }
            Err(e) => tracing::error!(error = %e, "failed to serialize client op"),
        }
    }

    pub fn is_running(&self) -> bool {
        self.driver_active.load(Ordering::Acquire)
    }

    /// Close the connection and stop the run loop. Safe to call from any
    /// task; a pending reconnect is cancelled rather than fired.
    pub fn disconnect(&self) {
        self.lock_core().disconnect();
        self.shutdown.notify_one();
    }

    /// Text of the assistant message currently streaming; see
    /// [`StreamReducer::visible_content`].
    pub fn visible_content(&self) -> String {
        self.lock_reducer().visible_content().to_string()
    }

    pub fn message(&self, id: &str) -> Option<String> {
        self.lock_reducer().message(id).map(str::to_string)
    }

    pub fn malformed_frames(&self) -> u64 {
        self.malformed_frames.load(Ordering::Relaxed)
    }

    /// Drive the connection until user close, retry exhaustion or an
    /// authorization rejection. May be called again after it returns;
    /// frames queued in the interim are flushed on the next open.
    pub async fn run(&self) -> Result<(), TransportError> {
        let dial_url = self.dial_url()?;
        self.driver_active.store(true, Ordering::Release);
        let _active = DriverGuard(&self.driver_active);
        self.lock_core().connect();

        loop {
            tracing::debug!(url = %self.config.url, "connecting");
            let dialed = tokio::select! {
                result = connect_async(dial_url.as_str()) => result,
                _ = self.shutdown.notified() => {
                    self.lock_core().disconnect();
                    return Ok(());
                }
            };

            match dialed {
                Ok((socket, _)) => match self.drive_connection(socket).await {
                    SessionEnd::Shutdown => return Ok(()),
                    SessionEnd::Unauthorized => {
                        self.lock_core().disconnect();
                        return Err(TransportError::Unauthorized);
                    }
                    SessionEnd::Lost => {}
                },
                Err(e) => tracing::warn!(error = %e, "connection attempt failed"),
            }

            let disposition = self.lock_core().on_connection_lost();
            match disposition {
                CloseDisposition::UserClose => return Ok(()),
                CloseDisposition::GiveUp => {
                    return Err(TransportError::RetriesExhausted {
                        attempts: self.config.retry.max_attempts,
                    })
                }
                CloseDisposition::Retry { attempt, delay } => {
                    tracing::info!(
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        "connection lost, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.notified() => {}
                    }
                    if let RetryAction::Cancelled = self.lock_core().retry_due() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn drive_connection(
        &self,
        socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    ) -> SessionEnd {
        let (mut tx, mut rx) = socket.split();

        // Backlog first (it predates this connection), then the standing
        // subscriptions.
        let backlog = self.lock_core().on_open();
        for frame in backlog {
            if tx.send(Message::Text(frame)).await.is_err() {
                return SessionEnd::Lost;
            }
        }
        for topic in &self.config.topics {
            let op = ClientOp::Subscribe {
                topic: topic.to_string(),
            };
            if let Ok(frame) = serde_json::to_string(&op) {
                if tx.send(Message::Text(frame)).await.is_err() {
                    return SessionEnd::Lost;
                }
            }
        }
        tracing::info!(url = %self.config.url, "connected");

        loop {
            tokio::select! {
                msg = rx.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(end) = self.handle_frame(&text, &mut tx).await {
                            return end;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.as_ref().map(|f| u16::from(f.code));
                        if code == Some(CLOSE_UNAUTHORIZED) {
                            tracing::error!("server closed: unauthorized");
                            return SessionEnd::Unauthorized;
                        }
                        tracing::info!(code = ?code, "server closed the connection");
                        return SessionEnd::Lost;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if tx.send(Message::Pong(payload)).await.is_err() {
                            return SessionEnd::Lost;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "socket error");
                        return SessionEnd::Lost;
                    }
                    None => return SessionEnd::Lost,
                },
                _ = self.send_notify.notified() => {
                    let frames = self.lock_core().drain_queued();
                    for frame in frames {
                        if tx.send(Message::Text(frame)).await.is_err() {
                            return SessionEnd::Lost;
                        }
                    }
                }
                _ = self.shutdown.notified() => {
                    let _ = tx.send(Message::Close(None)).await;
                    self.lock_core().disconnect();
                    return SessionEnd::Shutdown;
                }
            }
        }
    }

    /// Returns `Some` when the frame terminates the session.
    async fn handle_frame(&self, text: &str, tx: &mut WsWriter) -> Option<SessionEnd> {
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(env) => env,
            Err(e) => {
                self.malformed_frames.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, "dropping malformed server frame");
                return None;
            }
        };

        if envelope.kind == EventKind::HEARTBEAT {
            if let Ok(pong) = serde_json::to_string(&ClientOp::Pong) {
                if tx.send(Message::Text(pong)).await.is_err() {
                    return Some(SessionEnd::Lost);
                }
            }
        } else if EventKind::is_stream_kind(&envelope.kind) {
            self.lock_reducer().apply(&envelope);
        }

        (self.on_envelope)(&envelope);
        None
    }

    fn dial_url(&self) -> Result<String, TransportError> {
        let mut url = Url::parse(&self.config.url)
            .map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
        url.query_pairs_mut().append_pair("token", &self.config.token);
        Ok(url.into())
    }
}
