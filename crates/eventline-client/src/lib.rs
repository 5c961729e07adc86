//! WebSocket client for the eventline server.
//!
//! [`EventClient`] maintains a connection with exponential-backoff
//! reconnect, re-subscribes on every open, and buffers outbound ops in a
//! bounded queue while offline. Streaming chat events are folded by
//! [`StreamReducer`] into per-message text that stays coherent even when
//! the message id arrives after its first fragments.

pub mod reducer;
pub mod transport;

pub use reducer::StreamReducer;
pub use transport::ws::{ClientConfig, EnvelopeHandler, EventClient};
pub use transport::{RetryPolicy, TransportError, TransportState};
