use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::topic::Topic;

/// Current wire format version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Uniform wire unit wrapping a typed event with topic and sequence metadata.
///
/// `sequence` is strictly increasing per topic per bridge instance, starting
/// at 0 at first use of the topic. Consumers may use it to detect gaps; it
/// does not promise exactly-once delivery. Connection-level control
/// envelopes (heartbeat, subscription acks) are unsequenced and carry
/// [`Envelope::CONTROL_SEQUENCE`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u32,
    #[serde(rename = "type")]
    pub kind: String,
    pub topic: String,
    pub timestamp_ms: i64,
    pub sequence: i64,
    pub data: Value,
}

impl Envelope {
    /// Sequence value used by unsequenced control envelopes.
    pub const CONTROL_SEQUENCE: i64 = -1;

    /// Build a sequenced envelope for a bridge topic.
    pub fn new(kind: impl Into<String>, topic: &Topic, sequence: i64, data: Value) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            kind: kind.into(),
            topic: topic.to_string(),
            timestamp_ms: Utc::now().timestamp_millis(),
            sequence,
            data,
        }
    }

    /// Build an unsequenced connection-level control envelope.
    pub fn control(kind: impl Into<String>, data: Value) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            kind: kind.into(),
            topic: String::new(),
            timestamp_ms: Utc::now().timestamp_millis(),
            sequence: Self::CONTROL_SEQUENCE,
            data,
        }
    }

    pub fn is_control(&self) -> bool {
        self.sequence == Self::CONTROL_SEQUENCE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn wire_shape() {
        let topic = Topic::Conversation(Uuid::new_v4());
        let env = Envelope::new("stream_chunk", &topic, 7, json!({"content": "hi"}));
        let value: Value = serde_json::from_str(&serde_json::to_string(&env).unwrap()).unwrap();

        assert_eq!(value["version"], 1);
        assert_eq!(value["type"], "stream_chunk");
        assert_eq!(value["topic"], topic.to_string());
        assert_eq!(value["sequence"], 7);
        assert_eq!(value["data"]["content"], "hi");
        assert!(value["timestamp_ms"].as_i64().unwrap() > 0);
    }

    #[test]
    fn control_envelope_is_unsequenced() {
        let env = Envelope::control("heartbeat", json!({}));
        assert!(env.is_control());
        assert_eq!(env.sequence, Envelope::CONTROL_SEQUENCE);
        assert!(env.topic.is_empty());
    }
}
