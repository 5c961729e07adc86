//! In-process publish/subscribe keyed by event kind.
//!
//! The bus carries domain events from collaborators (workflow engine, chat
//! engine, telemetry producers) to in-process consumers. It holds no
//! history: an event published with no matching subscriber is gone.
//!
//! Each subscription owns a bounded channel drained by its own task, so a
//! slow handler stalls only its own subscription. `publish` never blocks
//! and never reports subscriber failures back to the caller.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use eventline_protocol::kind_matches;

/// Per-subscription channel depth. Overflow drops the event for that
/// subscriber only and bumps [`EventBus::dropped_events`].
const SUBSCRIPTION_BUFFER: usize = 256;

/// A single domain event as handed to `publish`.
#[derive(Debug, Clone)]
pub struct BusEvent {
    pub kind: String,
    pub payload: Value,
}

/// Boxed async handler invoked on the subscription's drain task.
pub type Handler = Arc<
    dyn Fn(BusEvent) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send + Sync,
>;

/// Token returned by [`EventBus::subscribe`]; pass it back to
/// [`EventBus::unsubscribe`] to tear the subscription down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionToken(u64);

struct Subscription {
    pattern: String,
    tx: mpsc::Sender<BusEvent>,
}

pub struct EventBus {
    subscriptions: RwLock<HashMap<u64, Subscription>>,
    next_id: AtomicU64,
    dropped: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Publish an event. Fire-and-forget: the call returns once the event
    /// has been offered to every matching subscription's channel.
    pub async fn publish(&self, kind: impl Into<String>, payload: Value) {
        let event = BusEvent {
            kind: kind.into(),
            payload,
        };

        let subscriptions = self.subscriptions.read().await;
        let mut matched = 0u32;
        for sub in subscriptions.values() {
            if !kind_matches(&sub.pattern, &event.kind) {
                continue;
            }
            matched += 1;
            match sub.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(kind = %event.kind, pattern = %sub.pattern, "subscriber channel full, event dropped");
                }
                // Drain task gone; unsubscribe cleans the entry up.
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        debug!(kind = %event.kind, matched, "published event");
    }

    /// Register a handler for kinds matching `pattern` (wildcards allowed,
    /// see [`kind_matches`]).
    ///
    /// The handler runs on a dedicated task; errors are logged and never
    /// reach the publisher.
    pub async fn subscribe(&self, pattern: &str, handler: Handler) -> SubscriptionToken {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::channel::<BusEvent>(SUBSCRIPTION_BUFFER);

        self.subscriptions.write().await.insert(
            id,
            Subscription {
                pattern: pattern.to_string(),
                tx,
            },
        );

        let pattern = pattern.to_string();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let kind = event.kind.clone();
                if let Err(e) = handler(event).await {
                    warn!(pattern = %pattern, kind = %kind, error = %e, "subscriber handler failed");
                }
            }
            debug!(pattern = %pattern, "subscription drain task ended");
        });

        SubscriptionToken(id)
    }

    /// Remove a subscription. The drain task finishes its backlog and exits.
    pub async fn unsubscribe(&self, token: SubscriptionToken) {
        self.subscriptions.write().await.remove(&token.0);
    }

    /// Events dropped because a subscriber's channel was full.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
