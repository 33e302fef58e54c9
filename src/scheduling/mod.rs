//! Scheduling affinity.
//!
//! Each thread may have an ambient [`SchedulingContext`]. Continuations
//! attached to a pending task capture the ambient context at attach time and
//! are posted through it when the task completes. Continuations attached to
//! a terminal task always run inline, so already-finished work never pays
//! for a context switch.
//!
//! A context installs itself as the ambient context while it runs posted
//! work, so continuations chained from inside posted work stay on it.

mod pump;
mod tokio_context;

pub use pump::PumpContext;
pub use tokio_context::TokioContext;

use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::Arc;

/// Unit of work posted to a context.
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// Somewhere continuations can be marshaled to.
pub trait SchedulingContext: Send + Sync {
    /// Queue `work` to run on this context.
    fn post(&self, work: Work);
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<dyn SchedulingContext>>> = const { RefCell::new(None) };
}

/// The ambient context of the calling thread.
pub fn current() -> Option<Arc<dyn SchedulingContext>> {
    CURRENT.with(|current| current.borrow().clone())
}

/// Make `context` the ambient context until the guard drops.
pub fn enter(context: Arc<dyn SchedulingContext>) -> ContextGuard {
    ContextGuard::replace(Some(context))
}

/// Clear the ambient context until the guard drops.
pub fn suppress() -> ContextGuard {
    ContextGuard::replace(None)
}

/// Run `work` with `context` as the ambient context.
pub fn run_within(context: Arc<dyn SchedulingContext>, work: Work) {
    let _guard = enter(context);
    work();
}

/// Restores the previous ambient context when dropped.
pub struct ContextGuard {
    previous: Option<Arc<dyn SchedulingContext>>,
    // Guards restore thread-local state and must drop on the same thread.
    _thread_bound: PhantomData<*const ()>,
}

impl ContextGuard {
    fn replace(context: Option<Arc<dyn SchedulingContext>>) -> Self {
        let previous = CURRENT.with(|current| current.replace(context));
        Self {
            previous,
            _thread_bound: PhantomData,
        }
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| {
            *current.borrow_mut() = previous;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Inline {
        posts: AtomicUsize,
    }

    impl SchedulingContext for Inline {
        fn post(&self, work: Work) {
            self.posts.fetch_add(1, Ordering::SeqCst);
            work();
        }
    }

    #[test]
    fn test_no_ambient_context_by_default() {
        assert!(current().is_none());
    }

    #[test]
    fn test_enter_sets_and_restores_context() {
        let context: Arc<dyn SchedulingContext> = Arc::new(Inline {
            posts: AtomicUsize::new(0),
        });
        {
            let _guard = enter(context.clone());
            let ambient = current().unwrap();
            assert!(Arc::ptr_eq(&ambient, &context));
        }
        assert!(current().is_none());
    }

    #[test]
    fn test_suppress_hides_outer_context() {
        let context: Arc<dyn SchedulingContext> = Arc::new(Inline {
            posts: AtomicUsize::new(0),
        });
        let _outer = enter(context);
        {
            let _inner = suppress();
            assert!(current().is_none());
        }
        assert!(current().is_some());
    }

    #[test]
    fn test_run_within_installs_context_for_work() {
        let context: Arc<dyn SchedulingContext> = Arc::new(Inline {
            posts: AtomicUsize::new(0),
        });
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in_work = seen.clone();
        run_within(
            context,
            Box::new(move || {
                if current().is_some() {
                    seen_in_work.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(current().is_none());
    }

    #[test]
    fn test_pump_runs_posts_from_other_threads_in_order() {
        let pump = PumpContext::new();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let producer = pump.clone();
        let producer_log = log.clone();
        std::thread::spawn(move || {
            for i in 0..3 {
                let log = producer_log.clone();
                producer.post(Box::new(move || log.lock().push(i)));
            }
        })
        .join()
        .unwrap();

        assert_eq!(pump.run_pending(), 3);
        assert_eq!(*log.lock(), vec![0, 1, 2]);
        assert_eq!(pump.post_count(), 3);
        assert_eq!(pump.run_pending(), 0);
    }
}
