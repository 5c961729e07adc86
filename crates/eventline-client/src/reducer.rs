//! Reconstructs assistant message text from streaming events.
//!
//! Chunks for a message can arrive before the event that names the message
//! id. Until the id is known the text accumulates in a pending buffer; when
//! the id arrives the buffer is promoted to that message in one step, so
//! readers never observe the text split across both places.

use std::collections::HashMap;

use serde_json::Value;

use eventline_protocol::{Envelope, EventKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReducerState {
    Idle,
    Streaming,
}

pub struct StreamReducer {
    state: ReducerState,
    /// Message id of the in-flight stream, once announced.
    active_id: Option<String>,
    /// Text accumulated before the id is known.
    pending: String,
    /// Text keyed by message id for the in-flight stream. Emptied on
    /// `stream_end`; finished text is consumed through the envelope
    /// callback, not retained here.
    committed: HashMap<String, String>,
    malformed: u64,
    stray_chunks: u64,
}

impl Default for StreamReducer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamReducer {
    pub fn new() -> Self {
        Self {
            state: ReducerState::Idle,
            active_id: None,
            pending: String::new(),
            committed: HashMap::new(),
            malformed: 0,
            stray_chunks: 0,
        }
    }

    /// Feed one streaming envelope. Non-stream kinds are ignored.
    pub fn apply(&mut self, envelope: &Envelope) {
        match envelope.kind.as_str() {
            EventKind::STREAM_START => self.on_stream_start(),
            EventKind::STREAM_CHUNK => self.on_stream_chunk(&envelope.data),
            EventKind::ASSISTANT_ID => self.on_assistant_id(&envelope.data),
            EventKind::STREAM_END => self.on_stream_end(),
            _ => {}
        }
    }

    fn on_stream_start(&mut self) {
        // A new stream supersedes whatever was in flight. If the previous
        // stream's id never arrived its pending text is unattributable and
        // is dropped here rather than bleeding into the new message.
        self.state = ReducerState::Streaming;
        self.active_id = None;
        self.pending.clear();
    }

    fn on_stream_chunk(&mut self, data: &Value) {
        if self.state != ReducerState::Streaming {
            self.stray_chunks += 1;
            return;
        }
        let Some(content) = data.get("content").and_then(Value::as_str) else {
            self.malformed += 1;
            return;
        };
        match &self.active_id {
            Some(id) => {
                self.committed.entry(id.clone()).or_default().push_str(content);
            }
            None => self.pending.push_str(content),
        }
    }

    fn on_assistant_id(&mut self, data: &Value) {
        if self.state != ReducerState::Streaming {
            self.stray_chunks += 1;
            return;
        }
        let Some(id) = message_id(data) else {
            self.malformed += 1;
            return;
        };
        // Promote the pending buffer atomically: after this point chunks
        // append under the id and the pending buffer is empty.
        let buffered = std::mem::take(&mut self.pending);
        self.committed.entry(id.clone()).or_default().push_str(&buffered);
        self.active_id = Some(id);
    }

    fn on_stream_end(&mut self) {
        self.state = ReducerState::Idle;
        self.active_id = None;
        self.pending.clear();
        self.committed.clear();
    }

    /// Text of the message currently streaming, whether or not its id has
    /// arrived yet. Empty when no stream is in flight.
    pub fn visible_content(&self) -> &str {
        match &self.active_id {
            Some(id) => self.committed.get(id).map(String::as_str).unwrap_or(""),
            None => &self.pending,
        }
    }

    /// Text for a message id of the stream in flight. `None` once the
    /// stream ends.
    pub fn message(&self, id: &str) -> Option<&str> {
        self.committed.get(id).map(String::as_str)
    }

    pub fn malformed_events(&self) -> u64 {
        self.malformed
    }

    pub fn stray_chunks(&self) -> u64 {
        self.stray_chunks
    }
}

/// The id field arrives as a string from some producers and a bare number
/// from others; both normalize to a string key.
fn message_id(data: &Value) -> Option<String> {
    match data.get("message_id") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}
