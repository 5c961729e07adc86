use serde::{Deserialize, Serialize};

/// Client → server operations sent as text frames.
///
/// Unknown ops fail deserialization; the server drops the frame, bumps its
/// malformed-message counter and keeps the connection open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientOp {
    /// Subscribe to a topic. Admin-only topics close the connection with
    /// [`crate::CLOSE_UNAUTHORIZED`] when the connection lacks privilege.
    Subscribe { topic: String },
    /// Drop a subscription. No-op when not subscribed.
    Unsubscribe { topic: String },
    /// Reply to a server heartbeat; resets the idle clock.
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_wire_format() {
        let op: ClientOp = serde_json::from_str(r#"{"op":"subscribe","topic":"ops"}"#).unwrap();
        assert_eq!(
            op,
            ClientOp::Subscribe {
                topic: "ops".to_string()
            }
        );
    }

    #[test]
    fn pong_wire_format() {
        let json = serde_json::to_string(&ClientOp::Pong).unwrap();
        assert_eq!(json, r#"{"op":"pong"}"#);
    }

    #[test]
    fn unknown_op_is_rejected() {
        let result = serde_json::from_str::<ClientOp>(r#"{"op":"shutdown"}"#);
        assert!(result.is_err());
    }
}
