//! Shared work queue consumed by the pool

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::error::QueueError;
use crate::item::WorkItem;

/// A multi-producer, multi-consumer queue of work items
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Enqueue an item without waiting
    fn submit(&self, item: WorkItem) -> Result<(), QueueError>;

    /// Wait for the next item. Returns `None` once the queue is closed and empty.
    async fn take(&self) -> Option<WorkItem>;
}

/// Bounded [`WorkQueue`] backed by a tokio channel
pub struct ChannelWorkQueue {
    sender: Mutex<Option<mpsc::Sender<WorkItem>>>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<WorkItem>>,
    queued: AtomicUsize,
    capacity: usize,
}

impl ChannelWorkQueue {
    /// Create a queue holding at most `capacity` items (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            sender: Mutex::new(Some(sender)),
            receiver: tokio::sync::Mutex::new(receiver),
            queued: AtomicUsize::new(0),
            capacity,
        }
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stop accepting items. Consumers still drain what is queued.
    pub fn close(&self) {
        self.sender.lock().take();
    }
}

#[async_trait]
impl WorkQueue for ChannelWorkQueue {
    fn submit(&self, item: WorkItem) -> Result<(), QueueError> {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return Err(QueueError::Closed(item));
        };

        // Counted before the send so a consumer never sees it go negative
        self.queued.fetch_add(1, Ordering::AcqRel);
        sender.try_send(item).map_err(|e| {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            match e {
                TrySendError::Full(item) => QueueError::Full(item),
                TrySendError::Closed(item) => QueueError::Closed(item),
            }
        })
    }

    async fn take(&self) -> Option<WorkItem> {
        let item = self.receiver.lock().await.recv().await?;
        self.queued.fetch_sub(1, Ordering::AcqRel);
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_submit_and_take_in_order() {
        let queue = ChannelWorkQueue::new(4);
        let (first, _rx1) = WorkItem::with_receiver(json!(1));
        let (second, _rx2) = WorkItem::with_receiver(json!(2));
        let (first_id, second_id) = (first.id(), second.id());

        queue.submit(first).unwrap();
        queue.submit(second).unwrap();
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.take().await.unwrap().id(), first_id);
        assert_eq!(queue.take().await.unwrap().id(), second_id);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_full_queue_hands_item_back() {
        let queue = ChannelWorkQueue::new(1);
        let (first, _rx1) = WorkItem::with_receiver(json!(1));
        let (second, _rx2) = WorkItem::with_receiver(json!(2));
        let second_id = second.id();

        queue.submit(first).unwrap();
        match queue.submit(second) {
            Err(QueueError::Full(item)) => assert_eq!(item.id(), second_id),
            other => panic!("expected full queue, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_closed_queue_drains_then_ends() {
        let queue = ChannelWorkQueue::new(2);
        let (item, _rx) = WorkItem::with_receiver(json!(1));
        queue.submit(item).unwrap();
        queue.close();
        assert_eq!(queue.len(), 1);

        let (late, _late_rx) = WorkItem::with_receiver(json!(2));
        assert!(matches!(queue.submit(late), Err(QueueError::Closed(_))));

        assert!(queue.take().await.is_some());
        assert!(queue.take().await.is_none());
    }
}
