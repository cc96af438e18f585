//! # Bounded Drop-Oldest Frame Queue
//!
//! One `RelayQueue` sits between the broadcaster and each client's relay
//! worker. The broadcaster is the only producer, the relay the only consumer.
//!
//! Overflow is resolved inside a single lock acquisition: when the queue is
//! at capacity, the oldest retained frame is removed to admit the new one.
//! The broadcaster therefore never blocks on a slow client, and a recovering
//! client resumes with the newest frames after skipping a contiguous block
//! of old ones.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Result of one non-blocking enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The queue had room; nothing was discarded.
    Enqueued,
    /// The queue was at capacity; the oldest frame was discarded to admit
    /// the new one.
    Displaced,
}

/// Bounded FIFO of pre-serialized text frames.
pub struct RelayQueue {
    inner: Mutex<VecDeque<Arc<str>>>,
    capacity: usize,
    notify: Notify,
}

impl RelayQueue {
    /// Creates a queue holding at most `capacity` frames.
    ///
    /// # Panics
    /// Panics if `capacity` is zero; the server validates this at startup.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "relay queue capacity must be at least 1");
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
        }
    }

    /// Non-blocking enqueue with drop-oldest overflow.
    ///
    /// The full-check, the displacement and the insert all happen under one
    /// lock acquisition, so the queue depth never exceeds the capacity and
    /// the consumer cannot race the overflow handling.
    pub fn push_or_displace(&self, frame: Arc<str>) -> PushOutcome {
        let outcome = {
            let mut queue = self.inner.lock().expect("relay queue lock poisoned");
            if queue.len() < self.capacity {
                queue.push_back(frame);
                PushOutcome::Enqueued
            } else {
                queue.pop_front();
                queue.push_back(frame);
                PushOutcome::Displaced
            }
        };
        self.notify.notify_one();
        outcome
    }

    /// Removes and returns the oldest frame, suspending while the queue is
    /// empty.
    ///
    /// Cancel safe: a frame leaves the queue only in the poll that returns
    /// it, so dropping the future mid-wait never loses a frame.
    pub async fn recv(&self) -> Arc<str> {
        loop {
            if let Some(frame) = self.try_recv() {
                return frame;
            }
            self.notify.notified().await;
        }
    }

    /// Non-blocking pop.
    pub fn try_recv(&self) -> Option<Arc<str>> {
        self.inner
            .lock()
            .expect("relay queue lock poisoned")
            .pop_front()
    }

    /// Current queue depth.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("relay queue lock poisoned").len()
    }

    /// True when no frames are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn frame(text: &str) -> Arc<str> {
        Arc::from(text)
    }

    #[test]
    fn drops_oldest_when_full() {
        let queue = RelayQueue::new(2);
        assert_eq!(queue.push_or_displace(frame("a")), PushOutcome::Enqueued);
        assert_eq!(queue.push_or_displace(frame("b")), PushOutcome::Enqueued);
        assert_eq!(queue.push_or_displace(frame("c")), PushOutcome::Displaced);

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.try_recv().as_deref(), Some("b"));
        assert_eq!(queue.try_recv().as_deref(), Some("c"));
        assert!(queue.try_recv().is_none());
    }

    #[test]
    fn keeps_order_when_not_full() {
        let queue = RelayQueue::new(2);
        assert_eq!(queue.push_or_displace(frame("a")), PushOutcome::Enqueued);
        assert_eq!(queue.push_or_displace(frame("b")), PushOutcome::Enqueued);

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.try_recv().as_deref(), Some("a"));
        assert_eq!(queue.try_recv().as_deref(), Some("b"));
    }

    #[test]
    fn depth_never_exceeds_capacity() {
        let queue = RelayQueue::new(3);
        for i in 0..50 {
            queue.push_or_displace(frame(&i.to_string()));
            assert!(queue.len() <= 3);
        }
        // The three newest frames survive, in order.
        assert_eq!(queue.try_recv().as_deref(), Some("47"));
        assert_eq!(queue.try_recv().as_deref(), Some("48"));
        assert_eq!(queue.try_recv().as_deref(), Some("49"));
    }

    #[tokio::test]
    async fn recv_suspends_until_a_frame_arrives() {
        let queue = Arc::new(RelayQueue::new(1));

        // Nothing queued yet: recv must stay pending.
        let pending = tokio::time::timeout(Duration::from_millis(20), queue.recv()).await;
        assert!(pending.is_err());

        let producer = Arc::clone(&queue);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.push_or_displace(frame("late"));
        });

        let received = tokio::time::timeout(Duration::from_secs(1), queue.recv())
            .await
            .expect("recv should wake on push");
        assert_eq!(received.as_ref(), "late");
        handle.await.expect("producer task");
    }

    #[tokio::test]
    async fn recv_drains_in_fifo_order() {
        let queue = RelayQueue::new(4);
        for text in ["1", "2", "3"] {
            queue.push_or_displace(frame(text));
        }
        assert_eq!(queue.recv().await.as_ref(), "1");
        assert_eq!(queue.recv().await.as_ref(), "2");
        assert_eq!(queue.recv().await.as_ref(), "3");
    }
}
