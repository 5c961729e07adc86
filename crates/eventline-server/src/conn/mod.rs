//! Live connection state: per-connection lifecycle, subscriptions, and the
//! bounded outbound queue.

mod manager;
mod queue;

pub use manager::{run_heartbeat, ConnectionManager, SubscribeError};
pub use queue::OutboundQueue;

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::sync::Notify;
use uuid::Uuid;

use eventline_protocol::{Topic, CLOSE_IDLE_TIMEOUT, CLOSE_UNAUTHORIZED};

/// Authorization level granted at handshake from the presented token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthLevel {
    User,
    Admin,
}

/// Connection lifecycle. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Handshaking,
    Open,
    Closing,
    Closed,
}

/// Why a connection is being torn down. The first reason recorded wins and
/// decides the close code sent to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Client closed or the socket ended.
    PeerGone,
    /// Server-side shutdown of this connection.
    ServerClose,
    /// No traffic within the idle window.
    IdleTimeout,
    /// Subscription to a privileged topic without rights.
    Unauthorized,
    /// Fatal write error on the socket.
    WriteError,
}

impl CloseReason {
    pub fn close_code(self) -> u16 {
        match self {
            CloseReason::Unauthorized => CLOSE_UNAUTHORIZED,
            CloseReason::IdleTimeout => CLOSE_IDLE_TIMEOUT,
            CloseReason::PeerGone | CloseReason::ServerClose => 1000,
            CloseReason::WriteError => 1011,
        }
    }
}

/// One live client connection.
///
/// Holds topic ids as values; the reverse topic → connection-id index lives
/// in [`ConnectionManager`], so teardown is "remove this id from all
/// indices" with no back-pointers to chase.
pub struct Connection {
    pub id: Uuid,
    pub auth: AuthLevel,
    pub connected_at_ms: i64,
    state: Mutex<ConnectionState>,
    close_reason: Mutex<Option<CloseReason>>,
    subscriptions: Mutex<HashSet<Topic>>,
    queue: OutboundQueue,
    last_activity_ms: AtomicI64,
    closing_notify: Notify,
}

impl Connection {
    pub fn new(auth: AuthLevel, queue_capacity: usize) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            id: Uuid::new_v4(),
            auth,
            connected_at_ms: now,
            state: Mutex::new(ConnectionState::Handshaking),
            close_reason: Mutex::new(None),
            subscriptions: Mutex::new(HashSet::new()),
            queue: OutboundQueue::new(queue_capacity),
            last_activity_ms: AtomicI64::new(now),
            closing_notify: Notify::new(),
        }
    }

    fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ConnectionState {
        *Self::lock(&self.state)
    }

    /// `Handshaking → Open`, after the protocol upgrade and auth check.
    pub fn set_open(&self) -> bool {
        let mut state = Self::lock(&self.state);
        if *state == ConnectionState::Handshaking {
            *state = ConnectionState::Open;
            true
        } else {
            false
        }
    }

    /// `Handshaking | Open → Closing`. Records the reason (first wins) and
    /// closes the outbound queue so the writer drains and stops. Returns
    /// `false` when already closing or closed.
    pub fn begin_close(&self, reason: CloseReason) -> bool {
        let mut state = Self::lock(&self.state);
        match *state {
            ConnectionState::Handshaking | ConnectionState::Open => {
                *state = ConnectionState::Closing;
                Self::lock(&self.close_reason).get_or_insert(reason);
                self.queue.close();
                self.closing_notify.notify_waiters();
                true
            }
            ConnectionState::Closing | ConnectionState::Closed => false,
        }
    }

    /// `Closing → Closed` once the queue is drained or the grace period ran
    /// out. Idempotent.
    pub fn finish_close(&self) {
        *Self::lock(&self.state) = ConnectionState::Closed;
        self.queue.close();
        self.closing_notify.notify_waiters();
    }

    /// Resolve once the connection has left `Open` (or `Handshaking`), no
    /// matter which side initiated the close.
    pub async fn wait_closing(&self) {
        loop {
            let notified = self.closing_notify.notified();
            if matches!(
                self.state(),
                ConnectionState::Closing | ConnectionState::Closed
            ) {
                return;
            }
            notified.await;
        }
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *Self::lock(&self.close_reason)
    }

    pub fn queue(&self) -> &OutboundQueue {
        &self.queue
    }

    /// Record inbound traffic (any frame counts, including pongs).
    pub fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn idle_for_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.last_activity_ms.load(Ordering::Relaxed)
    }

    pub fn is_subscribed(&self, topic: &Topic) -> bool {
        Self::lock(&self.subscriptions).contains(topic)
    }

    pub fn subscription_topics(&self) -> Vec<Topic> {
        Self::lock(&self.subscriptions).iter().cloned().collect()
    }

    fn add_subscription(&self, topic: Topic) -> bool {
        Self::lock(&self.subscriptions).insert(topic)
    }

    fn remove_subscription(&self, topic: &Topic) -> bool {
        Self::lock(&self.subscriptions).remove(topic)
    }
}
