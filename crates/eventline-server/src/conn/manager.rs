//! Connection registry and topic fan-out.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use eventline_protocol::{Envelope, EventKind, Topic};

use super::{AuthLevel, CloseReason, Connection, ConnectionState};

/// Owns live connections and the topic → subscriber index.
///
/// Broadcast is O(N) non-blocking enqueue attempts: one backpressured
/// connection evicts its own oldest entry and never delays the others.
pub struct ConnectionManager {
    connections: RwLock<HashMap<Uuid, Arc<Connection>>>,
    topics: RwLock<HashMap<Topic, HashSet<Uuid>>>,
    queue_capacity: usize,
    broadcast_evictions: AtomicU64,
}

#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    #[error("topic '{topic}' requires admin authorization")]
    AdminRequired { topic: Topic },
}

impl ConnectionManager {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            topics: RwLock::new(HashMap::new()),
            queue_capacity,
            broadcast_evictions: AtomicU64::new(0),
        }
    }

    /// Create a connection in `Handshaking` and add it to the registry.
    pub async fn register(&self, auth: AuthLevel) -> Arc<Connection> {
        let conn = Arc::new(Connection::new(auth, self.queue_capacity));
        self.connections.write().await.insert(conn.id, conn.clone());
        info!(conn_id = %conn.id, auth = ?auth, "connection registered");
        conn
    }

    /// Add the connection to a topic's subscriber set.
    ///
    /// Admin-gated topics reject unprivileged connections; the caller closes
    /// the connection with [`eventline_protocol::CLOSE_UNAUTHORIZED`].
    /// Subscribing twice is a no-op.
    pub async fn subscribe(
        &self,
        conn: &Arc<Connection>,
        topic: Topic,
    ) -> Result<(), SubscribeError> {
        if topic.requires_admin() && conn.auth != AuthLevel::Admin {
            warn!(conn_id = %conn.id, topic = %topic, "unauthorized subscription attempt");
            return Err(SubscribeError::AdminRequired { topic });
        }

        if conn.add_subscription(topic.clone()) {
            self.topics
                .write()
                .await
                .entry(topic.clone())
                .or_default()
                .insert(conn.id);
            debug!(conn_id = %conn.id, topic = %topic, "subscribed");
        }
        Ok(())
    }

    /// Remove the connection from a topic's subscriber set. No-op when not
    /// subscribed.
    pub async fn unsubscribe(&self, conn: &Arc<Connection>, topic: &Topic) {
        if conn.remove_subscription(topic) {
            let mut topics = self.topics.write().await;
            if let Some(subscribers) = topics.get_mut(topic) {
                subscribers.remove(&conn.id);
                if subscribers.is_empty() {
                    topics.remove(topic);
                }
            }
            debug!(conn_id = %conn.id, topic = %topic, "unsubscribed");
        }
    }

    /// Fan an envelope out to every open subscriber of `topic`.
    ///
    /// Returns the number of queues the envelope reached. No I/O happens
    /// here; the per-connection writer drains the queue.
    pub async fn broadcast(&self, topic: &Topic, envelope: Envelope) -> usize {
        let subscriber_ids: Vec<Uuid> = {
            let topics = self.topics.read().await;
            match topics.get(topic) {
                Some(ids) => ids.iter().copied().collect(),
                None => return 0,
            }
        };

        let connections = self.connections.read().await;
        let mut delivered = 0;
        for id in subscriber_ids {
            let Some(conn) = connections.get(&id) else {
                continue;
            };
            if conn.state() != ConnectionState::Open {
                continue;
            }
            if conn.queue().push(envelope.clone()) {
                self.broadcast_evictions.fetch_add(1, Ordering::Relaxed);
                debug!(conn_id = %conn.id, topic = %topic, "outbound queue full, evicted oldest");
            }
            delivered += 1;
        }
        delivered
    }

    /// Tear a connection down and remove its id from every index.
    pub async fn remove(&self, conn_id: Uuid) {
        let removed = self.connections.write().await.remove(&conn_id);
        let Some(conn) = removed else { return };

        conn.begin_close(CloseReason::ServerClose);
        {
            let mut topics = self.topics.write().await;
            for topic in conn.subscription_topics() {
                if let Some(subscribers) = topics.get_mut(&topic) {
                    subscribers.remove(&conn_id);
                    if subscribers.is_empty() {
                        topics.remove(&topic);
                    }
                }
            }
        }
        conn.finish_close();
        info!(conn_id = %conn_id, "connection removed");
    }

    pub async fn get(&self, conn_id: Uuid) -> Option<Arc<Connection>> {
        self.connections.read().await.get(&conn_id).cloned()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn connection_ids(&self) -> Vec<Uuid> {
        self.connections.read().await.keys().copied().collect()
    }

    pub async fn subscriber_count(&self, topic: &Topic) -> usize {
        self.topics
            .read()
            .await
            .get(topic)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// Envelopes evicted across all connections due to full queues.
    pub fn broadcast_evictions(&self) -> u64 {
        self.broadcast_evictions.load(Ordering::Relaxed)
    }

    /// One heartbeat pass: enqueue a `heartbeat` envelope to every open
    /// connection and move connections with no traffic inside the idle
    /// window to `Closing`.
    pub async fn heartbeat_tick(&self, idle_timeout: Duration) {
        let now_ms = Utc::now().timestamp_millis();
        let idle_ms = idle_timeout.as_millis() as i64;

        let connections = self.connections.read().await;
        for conn in connections.values() {
            if conn.state() != ConnectionState::Open {
                continue;
            }
            if idle_ms > 0 && conn.idle_for_ms(now_ms) > idle_ms {
                warn!(conn_id = %conn.id, "idle timeout, closing connection");
                conn.begin_close(CloseReason::IdleTimeout);
                continue;
            }
            conn.queue().push(Envelope::control(
                EventKind::HEARTBEAT,
                serde_json::json!({ "at_ms": now_ms }),
            ));
        }
    }
}

/// Periodic heartbeat loop; spawned once at startup.
pub async fn run_heartbeat(
    manager: Arc<ConnectionManager>,
    interval: Duration,
    idle_timeout: Duration,
) {
    // A zero interval disables heartbeats (and with them the idle check);
    // tokio::time::interval panics on a zero period.
    if interval.is_zero() {
        return;
    }
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        manager.heartbeat_tick(idle_timeout).await;
    }
}
