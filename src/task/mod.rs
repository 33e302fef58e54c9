//! Continuation-based tasks.
//!
//! A [`Task<T>`] is a handle to one asynchronous computation. It starts
//! pending and moves exactly once into one of three terminal states:
//! completed with a value, faulted with one or more [`Fault`]s, or canceled.
//! Work is composed by attaching continuations ([`Task::then`],
//! [`Task::catch`], [`Task::finally`], [`iterate`]) rather than by blocking.
//!
//! # Example
//!
//! ```
//! use courier::task::{Task, TaskCompletionSource};
//!
//! let source = TaskCompletionSource::<u32>::new();
//! let doubled = source.task().map(|v| v * 2);
//!
//! source.try_set_result(21);
//! assert_eq!(doubled.wait().unwrap(), 42);
//! ```

mod cancel;
mod combinators;
mod fan_out;
mod fault;
mod future;
mod iterate;

pub use cancel::{CancellationSource, CancellationToken};
pub use combinators::{CatchInfo, CatchResult, ContinuationOptions};
pub use fan_out::when_all;
pub use fault::Fault;
pub use future::TaskFuture;
pub use iterate::iterate;

use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::error::DispatchError;

/// Type-erased value carried through the dispatch pipeline.
pub type AnyValue = Arc<dyn Any + Send + Sync>;

const PENDING: u8 = 0;
const COMPLETING: u8 = 1;
const DONE: u8 = 2;

/// Observable status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    RanToCompletion,
    Faulted,
    Canceled,
}

/// Terminal state of a task.
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    Completed(T),
    /// Never empty.
    Faulted(Vec<Fault>),
    Canceled,
}

impl<T> Outcome<T> {
    /// The status this outcome corresponds to.
    pub fn status(&self) -> TaskStatus {
        match self {
            Outcome::Completed(_) => TaskStatus::RanToCompletion,
            Outcome::Faulted(_) => TaskStatus::Faulted,
            Outcome::Canceled => TaskStatus::Canceled,
        }
    }

    /// Convert into the caller-facing result.
    ///
    /// A single fault is unwrapped; several faults are reported together.
    pub fn into_result(self) -> Result<T, TaskError> {
        match self {
            Outcome::Completed(value) => Ok(value),
            Outcome::Canceled => Err(TaskError::Canceled),
            Outcome::Faulted(mut faults) => {
                if faults.len() == 1 {
                    Err(TaskError::Faulted(faults.remove(0)))
                } else {
                    Err(TaskError::Aggregate(faults))
                }
            }
        }
    }

    fn normalized(self) -> Self {
        match self {
            Outcome::Faulted(faults) => Outcome::faulted(faults),
            other => other,
        }
    }

    fn faulted(faults: Vec<Fault>) -> Self {
        if faults.is_empty() {
            Outcome::Faulted(vec![Fault::new(DispatchError::InvalidOperation(
                "a task cannot fault without an error".to_string(),
            ))])
        } else {
            Outcome::Faulted(faults)
        }
    }
}

/// Error observed by callers that block on or await a task.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    #[error("task was canceled")]
    Canceled,

    #[error("{0}")]
    Faulted(Fault),

    #[error("{} errors occurred", .0.len())]
    Aggregate(Vec<Fault>),
}

impl TaskError {
    /// Returns true if the task was canceled rather than faulted.
    pub fn is_canceled(&self) -> bool {
        matches!(self, TaskError::Canceled)
    }

    /// The primary fault, if any.
    pub fn fault(&self) -> Option<&Fault> {
        match self {
            TaskError::Canceled => None,
            TaskError::Faulted(fault) => Some(fault),
            TaskError::Aggregate(faults) => faults.first(),
        }
    }

    /// All faults in the order they were raised.
    pub fn faults(&self) -> &[Fault] {
        match self {
            TaskError::Canceled => &[],
            TaskError::Faulted(fault) => std::slice::from_ref(fault),
            TaskError::Aggregate(faults) => faults,
        }
    }

    /// Borrow the primary fault's original error if it is of type `E`.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        self.fault().and_then(Fault::downcast_ref::<E>)
    }
}

type Callback<T> = Box<dyn FnOnce(&Outcome<T>) + Send>;

struct Shared<T> {
    state: AtomicU8,
    outcome: OnceLock<Outcome<T>>,
    callbacks: Mutex<Vec<Callback<T>>>,
    done: Condvar,
    observed: AtomicBool,
}

impl<T> Shared<T> {
    fn pending() -> Self {
        Self {
            state: AtomicU8::new(PENDING),
            outcome: OnceLock::new(),
            callbacks: Mutex::new(Vec::new()),
            done: Condvar::new(),
            observed: AtomicBool::new(false),
        }
    }

    fn completed(outcome: Outcome<T>) -> Self {
        let outcome_cell = OnceLock::new();
        let _ = outcome_cell.set(outcome.normalized());
        Self {
            state: AtomicU8::new(DONE),
            outcome: outcome_cell,
            callbacks: Mutex::new(Vec::new()),
            done: Condvar::new(),
            observed: AtomicBool::new(false),
        }
    }

    fn is_done(&self) -> bool {
        self.state.load(Ordering::Acquire) == DONE
    }

    /// Terminal outcome, if reached. Reading a fault marks it observed.
    fn peek(&self) -> Option<&Outcome<T>> {
        if !self.is_done() {
            return None;
        }
        let outcome = self.outcome.get()?;
        if matches!(outcome, Outcome::Faulted(_)) {
            self.mark_observed();
        }
        Some(outcome)
    }

    fn mark_observed(&self) {
        self.observed.store(true, Ordering::Release);
    }

    /// Move from pending to `outcome`. Only the first caller wins.
    ///
    /// Callbacks are handed to [`deliver`], so a completion triggered from
    /// inside another task's callback does not grow the stack.
    fn try_complete(this: &Arc<Self>, outcome: Outcome<T>) -> bool
    where
        T: 'static,
    {
        if this
            .state
            .compare_exchange(PENDING, COMPLETING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let _ = this.outcome.set(outcome.normalized());

        let callbacks = {
            let mut guard = this.callbacks.lock();
            this.state.store(DONE, Ordering::Release);
            this.done.notify_all();
            std::mem::take(&mut *guard)
        };

        if !callbacks.is_empty() {
            let shared = this.clone();
            deliver(Box::new(move || {
                if let Some(outcome) = shared.outcome.get() {
                    for callback in callbacks {
                        callback(outcome);
                    }
                }
            }));
        }
        true
    }

    /// Run `callback` once the task is terminal; inline if it already is.
    fn on_complete(&self, callback: Callback<T>) {
        {
            let mut guard = self.callbacks.lock();
            if !self.is_done() {
                guard.push(callback);
                return;
            }
        }
        if let Some(outcome) = self.outcome.get() {
            callback(outcome);
        }
    }

    fn wait(&self) {
        if self.is_done() {
            return;
        }
        let mut guard = self.callbacks.lock();
        while !self.is_done() {
            self.done.wait(&mut guard);
        }
    }

    fn wait_for(&self, timeout: Duration) -> bool {
        if self.is_done() {
            return true;
        }
        let mut guard = self.callbacks.lock();
        while !self.is_done() {
            if self.done.wait_for(&mut guard, timeout).timed_out() {
                return self.is_done();
            }
        }
        true
    }
}

type Delivery = Box<dyn FnOnce()>;

thread_local! {
    /// Callback batches waiting for the delivery loop already running on
    /// this thread. `None` when no loop is running.
    static DELIVERIES: RefCell<Option<VecDeque<Delivery>>> = const { RefCell::new(None) };
}

/// Run `delivery`, or queue it behind the delivery loop running on this
/// thread.
///
/// The outermost call drains the queue, so completing a long chain of
/// pending tasks takes constant stack. A panicking batch does not stop the
/// rest; the first panic is resumed once the queue is empty.
fn deliver(delivery: Delivery) {
    let mut next = Some(delivery);
    let queued = DELIVERIES.try_with(|queue| {
        let mut queue = queue.borrow_mut();
        match queue.as_mut() {
            Some(pending) => {
                pending.extend(next.take());
                true
            }
            None => {
                *queue = Some(VecDeque::new());
                false
            }
        }
    });
    // During thread-local teardown the batch runs directly.
    if matches!(queued, Ok(true)) {
        return;
    }

    let mut panic = None;
    while let Some(delivery) = next.take() {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(delivery)) {
            panic.get_or_insert(payload);
        }
        next = DELIVERIES
            .try_with(|queue| {
                let mut queue = queue.borrow_mut();
                let popped = queue.as_mut().and_then(VecDeque::pop_front);
                if popped.is_none() {
                    *queue = None;
                }
                popped
            })
            .ok()
            .flatten();
    }

    if let Some(payload) = panic {
        resume_unwind(payload);
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        if let Some(Outcome::Faulted(faults)) = self.outcome.get() {
            if !self.observed.load(Ordering::Acquire) {
                if let Some(first) = faults.first() {
                    warn!(
                        fault = %first,
                        count = faults.len(),
                        "Task fault was never observed"
                    );
                }
            }
        }
    }
}

/// Handle to an asynchronous computation.
///
/// Cloning a task clones the handle; all clones observe the same outcome.
pub struct Task<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("status", &self.status())
            .finish()
    }
}

impl<T> Task<T> {
    /// Current status. Never blocks.
    pub fn status(&self) -> TaskStatus {
        if !self.shared.is_done() {
            return TaskStatus::Pending;
        }
        self.shared
            .outcome
            .get()
            .map_or(TaskStatus::Pending, Outcome::status)
    }

    /// Returns true once the task reached any terminal state.
    pub fn is_completed(&self) -> bool {
        self.shared.is_done()
    }

    /// Returns true if the task completed with a value.
    pub fn is_completed_successfully(&self) -> bool {
        self.status() == TaskStatus::RanToCompletion
    }

    /// Returns true if the task ended with one or more faults.
    pub fn is_faulted(&self) -> bool {
        self.status() == TaskStatus::Faulted
    }

    /// Returns true if the task was canceled.
    pub fn is_canceled(&self) -> bool {
        self.status() == TaskStatus::Canceled
    }

    /// Faults of a faulted task. Marks them observed.
    pub fn faults(&self) -> Option<Vec<Fault>> {
        match self.shared.peek() {
            Some(Outcome::Faulted(faults)) => Some(faults.clone()),
            _ => None,
        }
    }

    /// Returns true if both handles refer to the same computation.
    pub fn ptr_eq(&self, other: &Task<T>) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl<T> Task<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// A task that already completed with `value`.
    pub fn from_result(value: T) -> Self {
        Self::from_outcome(Outcome::Completed(value))
    }

    /// A task that already faulted with `fault`.
    pub fn from_fault(fault: Fault) -> Self {
        Self::from_outcome(Outcome::Faulted(vec![fault]))
    }

    /// A task that already faulted with `error`.
    pub fn from_error<E>(error: E) -> Self
    where
        E: Into<Fault>,
    {
        Self::from_fault(error.into())
    }

    /// A task that already faulted with every fault in `faults`.
    pub fn from_faults(faults: Vec<Fault>) -> Self {
        Self::from_outcome(Outcome::faulted(faults))
    }

    /// A task that is already canceled.
    pub fn canceled() -> Self {
        Self::from_outcome(Outcome::Canceled)
    }

    /// A task already in `outcome`.
    pub fn from_outcome(outcome: Outcome<T>) -> Self {
        Self {
            shared: Arc::new(Shared::completed(outcome)),
        }
    }

    /// Run `f` inline and capture its result, error or panic in a task.
    pub fn run_synchronously<F>(f: F) -> Self
    where
        F: FnOnce() -> Result<T, Fault>,
    {
        match catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(value)) => Self::from_result(value),
            Ok(Err(fault)) => Self::from_fault(fault),
            Err(payload) => Self::from_fault(Fault::panicked(payload)),
        }
    }

    /// The value of a successfully completed task, without blocking.
    ///
    /// Returns `None` for pending, faulted and canceled tasks. A fault is
    /// marked observed.
    pub fn try_get_result(&self) -> Option<T> {
        match self.shared.peek() {
            Some(Outcome::Completed(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Terminal outcome, if reached.
    pub fn outcome(&self) -> Option<Outcome<T>> {
        self.shared.peek().cloned()
    }

    /// Block the calling thread until the task is terminal.
    ///
    /// Only the outermost synchronous entry point should block. Calling this
    /// from a thread that pumps the task's scheduling context deadlocks.
    /// The same holds inside a continuation when the task still depends on
    /// callbacks queued behind it on the calling thread.
    pub fn wait(&self) -> Result<T, TaskError> {
        self.shared.wait();
        match self.shared.peek() {
            Some(outcome) => outcome.clone().into_result(),
            None => Err(TaskError::Faulted(Fault::new(
                DispatchError::InvalidOperation("task finished without an outcome".to_string()),
            ))),
        }
    }

    /// Like [`Task::wait`], giving up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, TaskError>> {
        if !self.shared.wait_for(timeout) {
            return None;
        }
        self.shared.peek().map(|outcome| outcome.clone().into_result())
    }
}

impl Task<()> {
    /// A task that already completed with no value.
    pub fn completed() -> Self {
        Self::from_result(())
    }
}

/// Writable side of a task.
///
/// Any number of producers may race to complete it; the first wins and the
/// rest are rejected.
pub struct TaskCompletionSource<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for TaskCompletionSource<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> fmt::Debug for TaskCompletionSource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCompletionSource")
            .field("completed", &self.shared.is_done())
            .finish()
    }
}

impl<T> Default for TaskCompletionSource<T> {
    fn default() -> Self {
        Self {
            shared: Arc::new(Shared::pending()),
        }
    }
}

impl<T> TaskCompletionSource<T> {
    /// A source whose task is pending.
    pub fn new() -> Self {
        Self::default()
    }

    /// The task completed by this source.
    pub fn task(&self) -> Task<T> {
        Task {
            shared: self.shared.clone(),
        }
    }
}

impl<T: 'static> TaskCompletionSource<T> {
    /// Move the task into `outcome`. Returns false if it was already terminal.
    pub fn try_complete(&self, outcome: Outcome<T>) -> bool {
        Shared::try_complete(&self.shared, outcome)
    }

    /// Complete with `value` unless already terminal.
    pub fn try_set_result(&self, value: T) -> bool {
        self.try_complete(Outcome::Completed(value))
    }

    /// Fault with `fault` unless already terminal.
    pub fn try_set_fault(&self, fault: Fault) -> bool {
        self.try_complete(Outcome::Faulted(vec![fault]))
    }

    /// Fault with every fault in `faults` unless already terminal.
    pub fn try_set_faults(&self, faults: Vec<Fault>) -> bool {
        self.try_complete(Outcome::faulted(faults))
    }

    /// Cancel unless already terminal.
    pub fn try_set_canceled(&self) -> bool {
        self.try_complete(Outcome::Canceled)
    }

    /// Complete with `value`, failing if the task was already completed.
    pub fn set_result(&self, value: T) -> crate::error::Result<()> {
        self.ensure(self.try_set_result(value))
    }

    /// Fault with `fault`, failing if the task was already completed.
    pub fn set_fault(&self, fault: Fault) -> crate::error::Result<()> {
        self.ensure(self.try_set_fault(fault))
    }

    /// Cancel, failing if the task was already completed.
    pub fn set_canceled(&self) -> crate::error::Result<()> {
        self.ensure(self.try_set_canceled())
    }

    fn ensure(&self, completed: bool) -> crate::error::Result<()> {
        if completed {
            Ok(())
        } else {
            Err(DispatchError::InvalidOperation(
                "task was already completed".to_string(),
            ))
        }
    }
}

/// Run `f`, turning a panic into a faulted task.
pub(crate) fn guard<U, F>(f: F) -> Task<U>
where
    U: Clone + Send + Sync + 'static,
    F: FnOnce() -> Task<U>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(task) => task,
        Err(payload) => Task::from_fault(Fault::panicked(payload)),
    }
}

/// Run `f`, turning a panic into a fault.
pub(crate) fn guard_result<R, F>(f: F) -> Result<R, Fault>
where
    F: FnOnce() -> Result<R, Fault>,
{
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| Err(Fault::panicked(payload)))
}
