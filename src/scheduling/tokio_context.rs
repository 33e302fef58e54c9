//! Context that marshals continuations onto a tokio runtime.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use tokio::runtime::Handle;

use super::{run_within, SchedulingContext, Work};

/// Posts work as tasks on a tokio runtime.
///
/// Work runs on the runtime's worker threads with this context installed as
/// the ambient context.
pub struct TokioContext {
    handle: Handle,
    posts: AtomicUsize,
    this: Weak<TokioContext>,
}

impl TokioContext {
    /// Context posting onto the runtime behind `handle`.
    pub fn new(handle: Handle) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            handle,
            posts: AtomicUsize::new(0),
            this: this.clone(),
        })
    }

    /// Context for the runtime the caller is running on.
    ///
    /// Returns `None` outside a tokio runtime.
    pub fn current() -> Option<Arc<Self>> {
        Handle::try_current().ok().map(Self::new)
    }

    /// Number of work items posted so far.
    pub fn post_count(&self) -> usize {
        self.posts.load(Ordering::SeqCst)
    }
}

impl SchedulingContext for TokioContext {
    fn post(&self, work: Work) {
        self.posts.fetch_add(1, Ordering::SeqCst);
        let this = self.this.upgrade();
        self.handle.spawn(async move {
            match this {
                Some(this) => run_within(this, work),
                None => work(),
            }
        });
    }
}
