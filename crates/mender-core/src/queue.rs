//! Bounded inter-stage queues with drop-newest-on-full publishing.
//!
//! Every hand-off between stages goes through a [`QueueSender`]. Publishing
//! never blocks: when the queue is at capacity the item being published is
//! discarded and the queue's drop counter is incremented by exactly one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};

/// Receiving half of a bounded queue.
pub type QueueReceiver<T> = mpsc::Receiver<T>;

/// Shared, read-only view of a queue's drop counter.
#[derive(Debug, Clone)]
pub struct DropCounter {
    name: Arc<str>,
    dropped: Arc<AtomicU64>,
}

impl DropCounter {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Non-blocking publishing half of a bounded queue.
#[derive(Debug)]
pub struct QueueSender<T> {
    tx: mpsc::Sender<T>,
    counter: DropCounter,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            counter: self.counter.clone(),
        }
    }
}

/// Result of a single [`QueueSender::publish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Publish {
    Sent,
    /// Queue at capacity; the item was dropped and counted.
    Dropped,
    /// Receiver is gone; the item was discarded.
    Closed,
}

/// Create a bounded queue named `name` holding at most `capacity` items.
///
/// `capacity` must be non-zero; callers validate it through configuration.
pub fn bounded<T>(name: &str, capacity: usize) -> (QueueSender<T>, QueueReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let counter = DropCounter {
        name: Arc::from(name),
        dropped: Arc::new(AtomicU64::new(0)),
    };
    (QueueSender { tx, counter }, rx)
}

impl<T> QueueSender<T> {
    /// Publish without blocking.
    pub fn publish(&self, item: T) -> Publish {
        match self.tx.try_send(item) {
            Ok(()) => Publish::Sent,
            Err(TrySendError::Full(_)) => {
                let total = self.counter.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(queue = %self.counter.name, dropped = total, "queue full, dropping newest item");
                Publish::Dropped
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(queue = %self.counter.name, "queue closed, discarding item");
                Publish::Closed
            }
        }
    }

    pub fn name(&self) -> &str {
        self.counter.name()
    }

    /// Items dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.counter.get()
    }

    pub fn drop_counter(&self) -> DropCounter {
        self.counter.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_drops_newest_when_full() {
        let (tx, mut rx) = bounded::<u32>("test", 2);
        assert_eq!(tx.publish(1), Publish::Sent);
        assert_eq!(tx.publish(2), Publish::Sent);
        assert_eq!(tx.publish(3), Publish::Dropped);
        assert_eq!(tx.dropped(), 1);

        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(tx.publish(4), Publish::Sent);
        assert_eq!(rx.recv().await, Some(4));
        assert_eq!(tx.dropped(), 1);
    }

    #[tokio::test]
    async fn test_drop_counter_shared_between_clones() {
        let (tx, _rx) = bounded::<u32>("shared", 1);
        let other = tx.clone();
        let counter = tx.drop_counter();
        tx.publish(1);
        other.publish(2);
        tx.publish(3);
        assert_eq!(counter.get(), 2);
        assert_eq!(counter.name(), "shared");
    }

    #[tokio::test]
    async fn test_publish_after_receiver_dropped() {
        let (tx, rx) = bounded::<u32>("closed", 1);
        drop(rx);
        assert_eq!(tx.publish(1), Publish::Closed);
        assert_eq!(tx.dropped(), 0);
        assert!(tx.is_closed());
    }
}
