//! Bounded in-memory queue backed by a tokio mpsc channel.

use std::collections::HashSet;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::{MessageQueue, QueuedMessage};
use crate::config::QueueConfig;
use crate::error::{DispatchError, Result};

/// In-process queue.
///
/// Closing the queue stops new messages; messages already queued are still
/// handed out until drained.
pub struct InMemoryQueue {
    sender: parking_lot::Mutex<Option<mpsc::Sender<QueuedMessage>>>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<QueuedMessage>>,
    in_flight: parking_lot::Mutex<HashSet<Uuid>>,
}

impl InMemoryQueue {
    /// A queue holding at most `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender: parking_lot::Mutex::new(Some(sender)),
            receiver: tokio::sync::Mutex::new(receiver),
            in_flight: parking_lot::Mutex::new(HashSet::new()),
        }
    }

    /// A queue sized from `config`.
    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.capacity)
    }

    /// Refuse further messages.
    pub fn close(&self) {
        if self.sender.lock().take().is_some() {
            debug!("Queue closed");
        }
    }

    /// Messages handed out but not yet marked complete.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    #[tracing::instrument(name = "queue.enqueue", skip_all, fields(message_id = %message.id()))]
    async fn enqueue(&self, message: QueuedMessage) -> Result<()> {
        let sender = self
            .sender
            .lock()
            .clone()
            .ok_or_else(|| DispatchError::Queue("queue is closed".to_string()))?;
        sender
            .send(message)
            .await
            .map_err(|_| DispatchError::Queue("queue is closed".to_string()))
    }

    async fn dequeue(&self) -> Option<QueuedMessage> {
        let message = self.receiver.lock().await.recv().await?;
        self.in_flight.lock().insert(message.id());
        Some(message)
    }

    async fn mark_complete(&self, id: Uuid) -> Result<()> {
        if self.in_flight.lock().remove(&id) {
            Ok(())
        } else {
            Err(DispatchError::Queue(format!("message {id} is not in flight")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ping(u32);

    #[test]
    fn test_fifo_and_completion_tracking() {
        tokio_test::block_on(async {
            let queue = InMemoryQueue::new(4);
            let first = QueuedMessage::command::<_, ()>(Ping(1));
            let second = QueuedMessage::event(Ping(2));
            let first_id = first.id();

            queue.enqueue(first).await.unwrap();
            queue.enqueue(second).await.unwrap();

            let received = queue.dequeue().await.unwrap();
            assert_eq!(received.id(), first_id);
            assert_eq!(queue.in_flight(), 1);

            queue.mark_complete(first_id).await.unwrap();
            assert_eq!(queue.in_flight(), 0);
            assert!(queue.mark_complete(first_id).await.is_err());
        });
    }

    #[tokio::test]
    async fn test_closed_queue_drains_then_ends() {
        let queue = InMemoryQueue::new(4);
        queue.enqueue(QueuedMessage::event(Ping(1))).await.unwrap();
        queue.close();

        assert!(queue.enqueue(QueuedMessage::event(Ping(2))).await.is_err());
        assert!(queue.dequeue().await.is_some());
        assert!(queue.dequeue().await.is_none());
    }
}
