//! Envelope bridge: turns domain events from the bus into sequenced wire
//! envelopes and hands them to the connection manager.
//!
//! The bridge subscribes to the bus with `*` and runs on that single drain
//! task, so envelopes for any one topic reach the connection manager in the
//! order their sequences were assigned.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use eventline_protocol::{Envelope, EventKind, Topic};

use crate::bus::{BusEvent, EventBus, SubscriptionToken};
use crate::conn::ConnectionManager;

pub struct EnvelopeBridge {
    manager: Arc<ConnectionManager>,
    /// Next sequence per topic; first use of a topic starts at 0.
    sequences: Mutex<HashMap<Topic, i64>>,
    normalize_failures: AtomicU64,
}

#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    #[error("no topic derivation for kind '{0}'")]
    UnknownKind(String),
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("field '{0}' is not a valid uuid")]
    InvalidId(&'static str),
}

impl EnvelopeBridge {
    pub fn new(manager: Arc<ConnectionManager>) -> Arc<Self> {
        Arc::new(Self {
            manager,
            sequences: Mutex::new(HashMap::new()),
            normalize_failures: AtomicU64::new(0),
        })
    }

    /// Subscribe the bridge to every kind on the bus.
    pub async fn attach(self: &Arc<Self>, bus: &EventBus) -> SubscriptionToken {
        let bridge = self.clone();
        bus.subscribe(
            "*",
            Arc::new(move |event| {
                let bridge = bridge.clone();
                Box::pin(async move {
                    bridge.handle(event).await;
                    Ok(())
                })
            }),
        )
        .await
    }

    /// Normalize one event and fan it out. A bad event is dropped and
    /// counted; the bridge keeps going.
    pub async fn handle(&self, event: BusEvent) {
        match self.normalize(&event) {
            Ok((topic, envelope)) => {
                self.manager.broadcast(&topic, envelope).await;
            }
            Err(e) => {
                self.normalize_failures.fetch_add(1, Ordering::Relaxed);
                warn!(kind = %event.kind, error = %e, "dropping unnormalizable event");
            }
        }
    }

    fn lock_sequences(&self) -> MutexGuard<'_, HashMap<Topic, i64>> {
        self.sequences.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Derive the topic and wrap the payload into exactly one envelope.
    pub fn normalize(&self, event: &BusEvent) -> Result<(Topic, Envelope), NormalizeError> {
        let topic = derive_topic(&event.kind, &event.payload)?;
        let sequence = {
            let mut sequences = self.lock_sequences();
            let next = sequences.entry(topic.clone()).or_insert(0);
            let assigned = *next;
            *next += 1;
            assigned
        };
        let envelope = Envelope::new(&event.kind, &topic, sequence, event.payload.clone());
        Ok((topic, envelope))
    }

    /// Events dropped because normalization failed.
    pub fn normalize_failures(&self) -> u64 {
        self.normalize_failures.load(Ordering::Relaxed)
    }
}

/// Deterministic topic derivation from the event payload.
fn derive_topic(kind: &str, payload: &Value) -> Result<Topic, NormalizeError> {
    match kind {
        EventKind::EXECUTION_STARTED | EventKind::NODE_STATE | EventKind::EXECUTION_FINISHED => {
            Ok(Topic::WorkflowExecution(required_uuid(payload, "execution_id")?))
        }
        EventKind::STREAM_START
        | EventKind::STREAM_CHUNK
        | EventKind::ASSISTANT_ID
        | EventKind::STREAM_END => {
            Ok(Topic::Conversation(required_uuid(payload, "conversation_id")?))
        }
        EventKind::OPS_EVENT => Ok(Topic::Ops),
        other => Err(NormalizeError::UnknownKind(other.to_string())),
    }
}

fn required_uuid(payload: &Value, field: &'static str) -> Result<Uuid, NormalizeError> {
    let raw = payload
        .get(field)
        .and_then(Value::as_str)
        .ok_or(NormalizeError::MissingField(field))?;
    Uuid::parse_str(raw).map_err(|_| NormalizeError::InvalidId(field))
}
