use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Logical channel used to scope subscription and per-topic ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Fixed operational ticker topic. Admin-only.
    Ops,
    /// Events for a single workflow run.
    WorkflowExecution(Uuid),
    /// Events for a single chat thread.
    Conversation(Uuid),
}

impl Topic {
    pub const OPS: &'static str = "ops";

    /// Whether subscribing to this topic requires admin authorization.
    pub fn requires_admin(&self) -> bool {
        matches!(self, Topic::Ops)
    }

    pub fn parse(s: &str) -> Result<Self, TopicParseError> {
        if s == Self::OPS {
            return Ok(Topic::Ops);
        }
        if let Some(id) = s.strip_prefix("workflow_execution:") {
            let id = Uuid::parse_str(id)
                .map_err(|_| TopicParseError::InvalidId(s.to_string()))?;
            return Ok(Topic::WorkflowExecution(id));
        }
        if let Some(id) = s.strip_prefix("conversation:") {
            let id = Uuid::parse_str(id)
                .map_err(|_| TopicParseError::InvalidId(s.to_string()))?;
            return Ok(Topic::Conversation(id));
        }
        Err(TopicParseError::UnknownTopic(s.to_string()))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Ops => write!(f, "{}", Self::OPS),
            Topic::WorkflowExecution(id) => write!(f, "workflow_execution:{}", id),
            Topic::Conversation(id) => write!(f, "conversation:{}", id),
        }
    }
}

impl FromStr for Topic {
    type Err = TopicParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::parse(s)
    }
}

impl Serialize for Topic {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Topic {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Topic::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TopicParseError {
    #[error("unknown topic: {0}")]
    UnknownTopic(String),
    #[error("invalid id in topic: {0}")]
    InvalidId(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ops_topic_round_trip() {
        let topic = Topic::parse("ops").unwrap();
        assert_eq!(topic, Topic::Ops);
        assert!(topic.requires_admin());
        assert_eq!(topic.to_string(), "ops");
    }

    #[test]
    fn execution_topic_round_trip() {
        let id = Uuid::new_v4();
        let raw = format!("workflow_execution:{}", id);
        let topic = Topic::parse(&raw).unwrap();
        assert_eq!(topic, Topic::WorkflowExecution(id));
        assert!(!topic.requires_admin());
        assert_eq!(topic.to_string(), raw);
    }

    #[test]
    fn conversation_topic_round_trip() {
        let id = Uuid::new_v4();
        let raw = format!("conversation:{}", id);
        let topic = Topic::parse(&raw).unwrap();
        assert_eq!(topic, Topic::Conversation(id));
        assert!(!topic.requires_admin());
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            Topic::parse("dashboard:1"),
            Err(TopicParseError::UnknownTopic(_))
        ));
        assert!(matches!(
            Topic::parse("conversation:not-a-uuid"),
            Err(TopicParseError::InvalidId(_))
        ));
    }

    #[test]
    fn serializes_as_string() {
        let id = Uuid::new_v4();
        let json = serde_json::to_string(&Topic::Conversation(id)).unwrap();
        assert_eq!(json, format!("\"conversation:{}\"", id));
    }
}
