//! Single-threaded message pump context.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crossbeam::channel::{unbounded, Receiver, Sender};

use super::{run_within, SchedulingContext, Work};
use crate::task::Task;

enum Message {
    Run(Work),
    Wake,
}

/// A context whose posted work runs on whichever thread pumps it.
///
/// Models thread-affine environments such as a UI thread: all posted work
/// runs one item at a time on the pumping thread, in post order. Only one
/// thread should pump a given context at a time.
pub struct PumpContext {
    sender: Sender<Message>,
    receiver: Receiver<Message>,
    posts: AtomicUsize,
    this: Weak<PumpContext>,
}

impl PumpContext {
    /// An empty pump.
    pub fn new() -> Arc<Self> {
        let (sender, receiver) = unbounded();
        Arc::new_cyclic(|this| Self {
            sender,
            receiver,
            posts: AtomicUsize::new(0),
            this: this.clone(),
        })
    }

    /// Number of work items posted so far.
    pub fn post_count(&self) -> usize {
        self.posts.load(Ordering::SeqCst)
    }

    /// Pump posted work on the calling thread until `task` is terminal.
    pub fn run_until<T>(&self, task: &Task<T>)
    where
        T: Clone + Send + Sync + 'static,
    {
        let wake = self.sender.clone();
        task.attach(true, move |_| {
            let _ = wake.send(Message::Wake);
        });

        while !task.is_completed() {
            match self.receiver.recv() {
                Ok(Message::Run(work)) => self.run(work),
                Ok(Message::Wake) => {}
                Err(_) => break,
            }
        }
    }

    /// Run every item already posted, without blocking.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while let Ok(message) = self.receiver.try_recv() {
            if let Message::Run(work) = message {
                self.run(work);
                ran += 1;
            }
        }
        ran
    }

    fn run(&self, work: Work) {
        match self.this.upgrade() {
            Some(this) => run_within(this, work),
            None => work(),
        }
    }
}

impl SchedulingContext for PumpContext {
    fn post(&self, work: Work) {
        self.posts.fetch_add(1, Ordering::SeqCst);
        let _ = self.sender.send(Message::Run(work));
    }
}
