//! Bounded per-connection outbound queue with drop-oldest overflow.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use eventline_protocol::Envelope;

/// Bounded FIFO of wire envelopes.
///
/// `push` is non-blocking: when the queue is full the oldest entry is
/// evicted (never the newest) and the eviction counter bumped, so the
/// system favors recency over completeness under sustained overload.
/// Size never exceeds capacity.
pub struct OutboundQueue {
    inner: Mutex<VecDeque<Envelope>>,
    capacity: usize,
    evicted: AtomicU64,
    closed: AtomicBool,
    notify: Notify,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            evicted: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Envelope>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue without blocking. Returns `true` when an older entry was
    /// evicted to make room.
    pub fn push(&self, envelope: Envelope) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let evicted = {
            let mut queue = self.lock();
            let evicted = if queue.len() >= self.capacity {
                queue.pop_front();
                true
            } else {
                false
            };
            queue.push_back(envelope);
            evicted
        };
        if evicted {
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        evicted
    }

    /// Wait for the next envelope. Returns `None` once the queue is closed
    /// and drained.
    pub async fn pop(&self) -> Option<Envelope> {
        loop {
            let notified = self.notify.notified();
            {
                let mut queue = self.lock();
                if let Some(envelope) = queue.pop_front() {
                    return Some(envelope);
                }
                if self.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Close the queue. Pending entries remain poppable; further pushes are
    /// discarded.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total envelopes evicted due to overflow.
    pub fn evictions(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    fn envelope(n: i64) -> Envelope {
        Envelope {
            version: eventline_protocol::PROTOCOL_VERSION,
            kind: "node_state".to_string(),
            topic: "t".to_string(),
            timestamp_ms: 0,
            sequence: n,
            data: json!({ "n": n }),
        }
    }

    #[test]
    fn size_never_exceeds_capacity() {
        let queue = OutboundQueue::new(4);
        for n in 0..20 {
            queue.push(envelope(n));
            assert!(queue.len() <= 4);
        }
    }

    #[test]
    fn retains_the_newest_entries() {
        let queue = OutboundQueue::new(3);
        for n in 0..10 {
            queue.push(envelope(n));
        }
        let contents: Vec<i64> = {
            let mut out = Vec::new();
            while let Some(env) = {
                let mut q = queue.lock();
                q.pop_front()
            } {
                out.push(env.sequence);
            }
            out
        };
        assert_eq!(contents, vec![7, 8, 9]);
        assert_eq!(queue.evictions(), 7);
    }

    #[test]
    fn no_evictions_under_capacity() {
        let queue = OutboundQueue::new(8);
        for n in 0..8 {
            assert!(!queue.push(envelope(n)));
        }
        assert_eq!(queue.evictions(), 0);
        assert_eq!(queue.len(), 8);
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let queue = std::sync::Arc::new(OutboundQueue::new(4));
        let popper = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(envelope(1));
        let got = timeout(Duration::from_secs(1), popper).await.unwrap().unwrap();
        assert_eq!(got.unwrap().sequence, 1);
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let queue = OutboundQueue::new(4);
        queue.push(envelope(1));
        queue.push(envelope(2));
        queue.close();

        // Pushes after close are discarded.
        queue.push(envelope(3));

        assert_eq!(queue.pop().await.unwrap().sequence, 1);
        assert_eq!(queue.pop().await.unwrap().sequence, 2);
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn close_wakes_blocked_popper() {
        let queue = std::sync::Arc::new(OutboundQueue::new(4));
        let popper = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();
        let got = timeout(Duration::from_secs(1), popper).await.unwrap().unwrap();
        assert!(got.is_none());
    }
}
