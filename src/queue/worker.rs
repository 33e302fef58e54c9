//! Queue consumer.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::MessageQueue;
use crate::config::QueueConfig;
use crate::dispatch::Processor;

/// Drains a queue through a processor with a fixed number of consumer loops.
pub struct QueueWorker<Q> {
    processor: Arc<Processor>,
    queue: Arc<Q>,
    workers: usize,
}

impl<Q> QueueWorker<Q>
where
    Q: MessageQueue + 'static,
{
    /// A worker draining `queue` through `processor`.
    pub fn new(processor: Arc<Processor>, queue: Arc<Q>, config: &QueueConfig) -> Self {
        Self {
            processor,
            queue,
            workers: config.workers.max(1),
        }
    }

    /// Spawn the consumer loops on the current tokio runtime.
    ///
    /// Each loop ends when the queue is closed and drained.
    pub fn spawn(&self) -> Vec<JoinHandle<()>> {
        let handles = (0..self.workers)
            .map(|worker| {
                let processor = self.processor.clone();
                let queue = self.queue.clone();
                tokio::spawn(consume(worker, processor, queue))
            })
            .collect();

        info!(workers = self.workers, "Queue consumers started");
        handles
    }

    /// Run the consumer loops until the queue is closed and drained.
    pub async fn run(self) {
        for handle in self.spawn() {
            if let Err(e) = handle.await {
                error!(error = %e, "Queue consumer terminated abnormally");
            }
        }
        info!("Queue consumers stopped");
    }
}

async fn consume<Q>(worker: usize, processor: Arc<Processor>, queue: Arc<Q>)
where
    Q: MessageQueue + 'static,
{
    while let Some(message) = queue.dequeue().await {
        let id = message.id();
        let kind = message.kind();

        match processor.dispatch_envelope(message.envelope().clone()).await {
            Ok(_) => debug!(worker, message_id = %id, %kind, "Message dispatched"),
            Err(e) => error!(worker, message_id = %id, %kind, error = %e, "Message dispatch failed"),
        }

        if let Err(e) = queue.mark_complete(id).await {
            error!(worker, message_id = %id, error = %e, "Failed to mark message complete");
        }
    }
    debug!(worker, "Queue consumer finished");
}
