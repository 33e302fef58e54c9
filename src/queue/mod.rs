//! In-memory message hand-off.
//!
//! A [`MessageQueue`] carries envelopes from producers to a [`QueueWorker`],
//! which dispatches each one through a [`Processor`](crate::dispatch::Processor)
//! and marks it complete. Nothing is persisted.

mod memory;
mod worker;

pub use memory::InMemoryQueue;
pub use worker::QueueWorker;

use std::fmt;

use async_trait::async_trait;
use uuid::Uuid;

use crate::descriptor::MessageKind;
use crate::error::Result;
use crate::request::Envelope;

/// A message waiting for dispatch.
#[derive(Clone)]
pub struct QueuedMessage {
    id: Uuid,
    envelope: Envelope,
}

impl QueuedMessage {
    /// Queue `envelope` under a fresh id.
    pub fn new(envelope: Envelope) -> Self {
        Self {
            id: Uuid::new_v4(),
            envelope,
        }
    }

    /// Queue a command whose handler produces `R`.
    pub fn command<M, R>(message: M) -> Self
    where
        M: Send + Sync + 'static,
        R: 'static,
    {
        Self::new(Envelope::command::<M, R>(message))
    }

    /// Queue an event.
    pub fn event<M>(message: M) -> Self
    where
        M: Send + Sync + 'static,
    {
        Self::new(Envelope::event(message))
    }

    /// Id used to mark the message complete.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Command or event.
    pub fn kind(&self) -> MessageKind {
        self.envelope.kind()
    }

    /// The message to dispatch.
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }
}

impl fmt::Debug for QueuedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedMessage")
            .field("id", &self.id)
            .field("envelope", &self.envelope)
            .finish()
    }
}

/// Enqueue, dequeue and acknowledge capabilities consumed by the worker.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn enqueue(&self, message: QueuedMessage) -> Result<()>;

    /// Next message, or `None` once the queue is closed and drained.
    async fn dequeue(&self) -> Option<QueuedMessage>;

    async fn mark_complete(&self, id: Uuid) -> Result<()>;
}
