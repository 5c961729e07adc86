//! Shared wire protocol for the eventline server and clients.
//!
//! Everything that crosses the WebSocket boundary is defined here: the
//! [`Envelope`] wire unit, [`Topic`] identifiers, event kind constants,
//! client operations and close codes.

pub mod envelope;
pub mod message;
pub mod topic;

pub use envelope::{Envelope, PROTOCOL_VERSION};
pub use message::ClientOp;
pub use topic::{Topic, TopicParseError};

// ============================================================================
// Event Kind Constants
// ============================================================================

/// Recognized envelope `type` values.
///
/// The set is extensible: the bridge only needs to know a kind in order to
/// derive a topic for it, and clients ignore kinds they do not handle.
pub struct EventKind;

impl EventKind {
    // Connection-level control
    pub const HEARTBEAT: &'static str = "heartbeat";
    pub const SUBSCRIBED: &'static str = "subscribed";
    pub const ERROR: &'static str = "error";

    // Chat token streaming (fragment-correlated)
    pub const STREAM_START: &'static str = "stream_start";
    pub const STREAM_CHUNK: &'static str = "stream_chunk";
    pub const ASSISTANT_ID: &'static str = "assistant_id";
    pub const STREAM_END: &'static str = "stream_end";

    // Workflow execution lifecycle
    pub const EXECUTION_STARTED: &'static str = "execution_started";
    pub const NODE_STATE: &'static str = "node_state";
    pub const EXECUTION_FINISHED: &'static str = "execution_finished";

    // Operational telemetry
    pub const OPS_EVENT: &'static str = "ops_event";

    /// Whether a kind belongs to the fragment-correlated streaming family
    /// and should be routed through the streaming reducer rather than
    /// handed to the envelope callback directly.
    pub fn is_stream_kind(kind: &str) -> bool {
        matches!(
            kind,
            Self::STREAM_START | Self::STREAM_CHUNK | Self::ASSISTANT_ID | Self::STREAM_END
        )
    }
}

// ============================================================================
// Close codes
// ============================================================================

/// Subscription to a privileged topic without admin rights.
pub const CLOSE_UNAUTHORIZED: u16 = 4403;

/// No traffic (including pong) within the idle window.
pub const CLOSE_IDLE_TIMEOUT: u16 = 4408;

// ============================================================================
// Kind pattern matching
// ============================================================================

/// Match an event kind against a subscription pattern.
///
/// A trailing `*` matches any suffix, so `stream_*` matches `stream_chunk`
/// and a bare `*` matches everything. Anything else is an exact match.
pub fn kind_matches(pattern: &str, kind: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('*') {
        kind.starts_with(prefix)
    } else {
        kind == pattern
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_kind_match() {
        assert!(kind_matches("stream_chunk", "stream_chunk"));
        assert!(!kind_matches("stream_chunk", "stream_start"));
    }

    #[test]
    fn wildcard_prefix_match() {
        assert!(kind_matches("stream_*", "stream_chunk"));
        assert!(kind_matches("stream_*", "stream_end"));
        assert!(!kind_matches("stream_*", "execution_started"));
    }

    #[test]
    fn bare_wildcard_matches_everything() {
        assert!(kind_matches("*", "heartbeat"));
        assert!(kind_matches("*", "anything"));
    }

    #[test]
    fn stream_kind_classification() {
        assert!(EventKind::is_stream_kind(EventKind::STREAM_START));
        assert!(EventKind::is_stream_kind(EventKind::STREAM_CHUNK));
        assert!(EventKind::is_stream_kind(EventKind::ASSISTANT_ID));
        assert!(EventKind::is_stream_kind(EventKind::STREAM_END));
        assert!(!EventKind::is_stream_kind(EventKind::HEARTBEAT));
        assert!(!EventKind::is_stream_kind(EventKind::NODE_STATE));
    }
}
