//! Client transport: connect/reconnect state machine with a bounded local
//! send queue.
//!
//! [`TransportCore`] is pure state — every socket callback routes through an
//! explicit transition method, so tests drive the machine without real I/O.
//! [`ws::EventClient`] is the driver that owns the socket and executes the
//! actions the core hands back.

pub mod ws;

use std::collections::VecDeque;
use std::time::Duration;

/// Transport lifecycle. `Reconnecting` holds the attempt number of the
/// retry currently scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
}

/// Reconnect/backoff configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Failed attempts tolerated before the transport settles in
    /// `Disconnected` and surfaces a terminal error.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectAction {
    /// The driver should dial now.
    Dial,
    /// Already connected or a retry is pending; nothing to do.
    AlreadyActive,
}

/// What happened to a frame handed to [`TransportCore::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOutcome {
    /// The connected writer will flush it without waiting for a reconnect.
    pub immediate: bool,
    /// An older queued frame was evicted to make room.
    pub evicted: bool,
    /// The send kicked the transport from `Disconnected` into `Connecting`;
    /// the driver must dial.
    pub dial: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDisposition {
    /// `disconnect()` was called; not an error.
    UserClose,
    /// Schedule a retry after `delay`.
    Retry { attempt: u32, delay: Duration },
    /// Retry budget exhausted; surface a terminal failure.
    GiveUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    Dial,
    /// The retry was cancelled before it fired.
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("gave up after {attempts} connection attempts")]
    RetriesExhausted { attempts: u32 },
    #[error("server closed the connection: authorization failure")]
    Unauthorized,
    #[error("invalid server url: {0}")]
    InvalidUrl(String),
}

pub struct TransportCore {
    state: TransportState,
    policy: RetryPolicy,
    queue: VecDeque<String>,
    queue_capacity: usize,
    queue_evictions: u64,
    attempts: u32,
    /// Set by `disconnect()`; checked by the scheduled retry *before* it
    /// dials, so a user close always wins the race against a firing timer.
    cancelled: bool,
}

impl TransportCore {
    pub fn new(policy: RetryPolicy, queue_capacity: usize) -> Self {
        Self {
            state: TransportState::Disconnected,
            policy,
            queue: VecDeque::with_capacity(queue_capacity),
            queue_capacity,
            queue_evictions: 0,
            attempts: 0,
            cancelled: false,
        }
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    /// Begin (or resume) a connection attempt. A no-op while connected or
    /// while a retry is already scheduled.
    pub fn connect(&mut self) -> ConnectAction {
        match self.state {
            TransportState::Disconnected => {
                self.cancelled = false;
                self.state = TransportState::Connecting;
                ConnectAction::Dial
            }
            // A send() may already have moved us here; the driver dials.
            TransportState::Connecting => ConnectAction::Dial,
            TransportState::Connected | TransportState::Reconnecting { .. } => {
                ConnectAction::AlreadyActive
            }
        }
    }

    /// Handshake succeeded. Resets the attempt counter and returns the
    /// queued frames, oldest first, for the driver to flush.
    pub fn on_open(&mut self) -> Vec<String> {
        self.state = TransportState::Connected;
        self.attempts = 0;
        self.queue.drain(..).collect()
    }

    /// Hand a frame to the transport. Transmitted immediately when
    /// connected; otherwise queued (bounded, oldest evicted on overflow)
    /// and, from `Disconnected`, a connection attempt is started.
    pub fn send(&mut self, frame: String) -> SendOutcome {
        let evicted = if self.queue.len() >= self.queue_capacity {
            self.queue.pop_front();
            self.queue_evictions += 1;
            true
        } else {
            false
        };
        self.queue.push_back(frame);

        match self.state {
            TransportState::Connected => SendOutcome {
                immediate: true,
                evicted,
                dial: false,
            },
            TransportState::Disconnected => {
                self.cancelled = false;
                self.state = TransportState::Connecting;
                SendOutcome {
                    immediate: false,
                    evicted,
                    dial: true,
                }
            }
            TransportState::Connecting | TransportState::Reconnecting { .. } => SendOutcome {
                immediate: false,
                evicted,
                dial: false,
            },
        }
    }

    /// Take everything queued while connected; called by the driver when it
    /// is ready to write.
    pub fn drain_queued(&mut self) -> Vec<String> {
        self.queue.drain(..).collect()
    }

    /// The dial failed or an established connection dropped.
    pub fn on_connection_lost(&mut self) -> CloseDisposition {
        if self.cancelled {
            self.state = TransportState::Disconnected;
            return CloseDisposition::UserClose;
        }
        self.attempts += 1;
        if self.attempts > self.policy.max_attempts {
            self.state = TransportState::Disconnected;
            return CloseDisposition::GiveUp;
        }
        self.state = TransportState::Reconnecting {
            attempt: self.attempts,
        };
        CloseDisposition::Retry {
            attempt: self.attempts,
            delay: self.backoff(self.attempts),
        }
    }

    /// The scheduled retry fired. Checks the cancel flag before dialing.
    pub fn retry_due(&mut self) -> RetryAction {
        if self.cancelled || !matches!(self.state, TransportState::Reconnecting { .. }) {
            return RetryAction::Cancelled;
        }
        self.state = TransportState::Connecting;
        RetryAction::Dial
    }

    /// User-initiated close: suppresses any pending retry and goes straight
    /// to `Disconnected`. Distinguishable from an error close.
    pub fn disconnect(&mut self) {
        self.cancelled = true;
        self.state = TransportState::Disconnected;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.policy.base_delay * 2u32.saturating_pow(exponent);
        delay.min(self.policy.max_delay)
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    pub fn queue_evictions(&self) -> u64 {
        self.queue_evictions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base_ms: u64, max_ms: u64, max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
            max_attempts,
        }
    }

    fn connected_core() -> TransportCore {
        let mut core = TransportCore::new(policy(100, 400, 5), 4);
        core.connect();
        core.on_open();
        core
    }

    #[test]
    fn connect_is_idempotent_while_connected() {
        let mut core = connected_core();
        assert_eq!(core.connect(), ConnectAction::AlreadyActive);
        assert_eq!(core.state(), TransportState::Connected);
    }

    #[test]
    fn connect_while_retry_pending_is_noop() {
        let mut core = connected_core();
        core.on_connection_lost();
        assert!(matches!(
            core.state(),
            TransportState::Reconnecting { attempt: 1 }
        ));
        assert_eq!(core.connect(), ConnectAction::AlreadyActive);
    }

    #[test]
    fn send_while_connected_is_immediate() {
        let mut core = connected_core();
        let outcome = core.send("frame".to_string());
        assert!(outcome.immediate);
        assert!(!outcome.dial);
        assert_eq!(core.drain_queued(), vec!["frame".to_string()]);
    }

    #[test]
    fn send_while_disconnected_queues_and_dials() {
        let mut core = TransportCore::new(policy(100, 400, 5), 4);
        let outcome = core.send("frame".to_string());
        assert!(!outcome.immediate);
        assert!(outcome.dial);
        assert_eq!(core.state(), TransportState::Connecting);
        assert_eq!(core.queued_len(), 1);
    }

    #[test]
    fn queue_is_bounded_and_drops_oldest() {
        let mut core = TransportCore::new(policy(100, 400, 5), 3);
        for n in 0..7 {
            core.send(format!("frame{}", n));
        }
        assert_eq!(core.queued_len(), 3);
        assert_eq!(core.queue_evictions(), 4);

        // on_open flushes the retained newest, oldest-first.
        let backlog = core.on_open();
        assert_eq!(backlog, vec!["frame4", "frame5", "frame6"]);
        assert_eq!(core.queued_len(), 0);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut core = TransportCore::new(policy(100, 400, 10), 4);
        core.connect();

        let mut delays = Vec::new();
        for _ in 0..4 {
            match core.on_connection_lost() {
                CloseDisposition::Retry { delay, .. } => {
                    delays.push(delay.as_millis() as u64);
                    core.retry_due();
                }
                other => panic!("expected retry, got {:?}", other),
            }
        }
        assert_eq!(delays, vec![100, 200, 400, 400]);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let mut core = TransportCore::new(policy(10, 40, 2), 4);
        core.connect();

        assert!(matches!(
            core.on_connection_lost(),
            CloseDisposition::Retry { attempt: 1, .. }
        ));
        core.retry_due();
        assert!(matches!(
            core.on_connection_lost(),
            CloseDisposition::Retry { attempt: 2, .. }
        ));
        core.retry_due();
        assert_eq!(core.on_connection_lost(), CloseDisposition::GiveUp);
        assert_eq!(core.state(), TransportState::Disconnected);
    }

    #[test]
    fn successful_open_resets_attempt_counter() {
        let mut core = TransportCore::new(policy(100, 400, 5), 4);
        core.connect();
        core.on_connection_lost();
        core.retry_due();
        core.on_open();

        match core.on_connection_lost() {
            CloseDisposition::Retry { attempt, delay } => {
                assert_eq!(attempt, 1);
                assert_eq!(delay, Duration::from_millis(100));
            }
            other => panic!("expected retry, got {:?}", other),
        }
    }

    #[test]
    fn disconnect_during_reconnect_cancels_the_retry() {
        let mut core = connected_core();
        core.on_connection_lost();
        core.disconnect();

        // The scheduled retry fires after the cancel: it must not dial.
        assert_eq!(core.retry_due(), RetryAction::Cancelled);
        assert_eq!(core.state(), TransportState::Disconnected);
    }

    #[test]
    fn user_close_is_not_an_error() {
        let mut core = connected_core();
        core.disconnect();
        // The socket teardown that follows a user close folds into
        // UserClose, never a retry.
        assert_eq!(core.on_connection_lost(), CloseDisposition::UserClose);
    }

    #[test]
    fn connect_after_disconnect_clears_the_cancel_flag() {
        let mut core = connected_core();
        core.disconnect();
        assert_eq!(core.connect(), ConnectAction::Dial);
        assert!(!core.is_cancelled());
    }
}
