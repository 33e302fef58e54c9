//! Continuation combinators.
//!
//! All combinators follow the same affinity rule: a continuation attached to
//! a task that is already terminal runs inline on the attaching thread. A
//! continuation attached to a pending task captures the ambient scheduling
//! context at attach time and is posted through it on completion, unless the
//! options ask for synchronous execution.

use std::any::type_name;
use std::marker::PhantomData;
use std::sync::Arc;

use super::{guard, AnyValue, CancellationToken, Fault, Outcome, Task, TaskCompletionSource};
use crate::error::DispatchError;
use crate::scheduling;

const MISSING_CATCH_VERB: &str =
    "catch continuation returned without calling handled, throw or replace_with";

/// Options for attaching a continuation.
#[derive(Debug, Clone, Default)]
pub struct ContinuationOptions {
    /// Checked when the antecedent completes successfully.
    pub cancellation: Option<CancellationToken>,
    /// Run on the completing thread, ignoring the ambient context.
    pub run_synchronously: bool,
}

impl ContinuationOptions {
    /// Default options: marshal through the ambient context, no token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Options that never marshal onto a scheduling context.
    pub fn synchronous() -> Self {
        Self {
            cancellation: None,
            run_synchronously: true,
        }
    }

    /// Cancel the continuation if `token` is signaled when the antecedent completes.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Run on the completing thread.
    pub fn synchronously(mut self) -> Self {
        self.run_synchronously = true;
        self
    }

    fn is_cancellation_requested(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancellation_requested)
    }
}

impl<T> Task<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Deliver the outcome to `f` following the affinity rule.
    pub(crate) fn attach<F>(&self, run_synchronously: bool, f: F)
    where
        F: FnOnce(Outcome<T>) + Send + 'static,
    {
        self.shared.mark_observed();
        if let Some(outcome) = self.shared.peek() {
            f(outcome.clone());
            return;
        }

        let context = if run_synchronously {
            None
        } else {
            scheduling::current()
        };
        self.shared.on_complete(Box::new(move |outcome: &Outcome<T>| {
            let outcome = outcome.clone();
            match context {
                Some(context) => context.post(Box::new(move || f(outcome))),
                None => f(outcome),
            }
        }));
    }

    /// Mirror this task's outcome onto `target` without marshaling.
    pub(crate) fn forward_to(&self, target: TaskCompletionSource<T>) {
        self.attach(true, move |outcome| {
            target.try_complete(outcome);
        });
    }

    /// Run `f` on every terminal state and unwrap the task it returns.
    ///
    /// This is the primitive the other combinators are built on. A panic in
    /// `f` faults the returned task.
    pub fn continue_with<U, F>(&self, options: ContinuationOptions, f: F) -> Task<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(Outcome<T>) -> Task<U> + Send + 'static,
    {
        let source = TaskCompletionSource::new();
        let result = source.task();
        self.attach(options.run_synchronously, move |outcome| {
            guard(move || f(outcome)).forward_to(source);
        });
        result
    }

    /// Chain a fallible continuation onto a successful result.
    ///
    /// Faults and cancellation short-circuit: `f` is not called and the
    /// returned task carries the antecedent's state.
    pub fn then<U, F>(&self, f: F) -> Task<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> Result<U, Fault> + Send + 'static,
    {
        self.then_with(ContinuationOptions::default(), f)
    }

    /// [`Task::then`] with explicit options.
    ///
    /// If the cancellation token is signaled when the antecedent completes,
    /// the result is canceled and `f` is not called.
    pub fn then_with<U, F>(&self, options: ContinuationOptions, f: F) -> Task<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> Result<U, Fault> + Send + 'static,
    {
        self.then_task_with(options, move |value| match f(value) {
            Ok(value) => Task::from_result(value),
            Err(fault) => Task::from_fault(fault),
        })
    }

    /// Chain a continuation that produces another task.
    pub fn then_task<U, F>(&self, f: F) -> Task<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> Task<U> + Send + 'static,
    {
        self.then_task_with(ContinuationOptions::default(), f)
    }

    /// [`Task::then_task`] with explicit options.
    pub fn then_task_with<U, F>(&self, options: ContinuationOptions, f: F) -> Task<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> Task<U> + Send + 'static,
    {
        let check = options.clone();
        self.continue_with(options, move |outcome| match outcome {
            Outcome::Faulted(faults) => Task::from_faults(faults),
            Outcome::Canceled => Task::canceled(),
            Outcome::Completed(_) if check.is_cancellation_requested() => Task::canceled(),
            Outcome::Completed(value) => f(value),
        })
    }

    /// Transform a successful result.
    pub fn map<U, F>(&self, f: F) -> Task<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.then_task(move |value| Task::from_result(f(value)))
    }

    /// Intercept a fault.
    ///
    /// `f` runs only when this task faults and must resolve the fault with
    /// one of the [`CatchInfo`] verbs. Success and cancellation pass through
    /// untouched.
    pub fn catch<F>(&self, f: F) -> Task<T>
    where
        F: FnOnce(CatchInfo<T>) -> CatchResult<T> + Send + 'static,
    {
        self.catch_with(ContinuationOptions::default(), f)
    }

    /// [`Task::catch`] with explicit options.
    pub fn catch_with<F>(&self, options: ContinuationOptions, f: F) -> Task<T>
    where
        F: FnOnce(CatchInfo<T>) -> CatchResult<T> + Send + 'static,
    {
        self.continue_with(options, move |outcome| match outcome {
            Outcome::Faulted(faults) => f(CatchInfo::new(faults)).into_task(),
            other => Task::from_outcome(other),
        })
    }

    /// Run `action` exactly once whatever the terminal state.
    ///
    /// A panic in `action` replaces the original outcome with a fault.
    pub fn finally<F>(&self, action: F) -> Task<T>
    where
        F: FnOnce() + Send + 'static,
    {
        self.finally_with(ContinuationOptions::default(), action)
    }

    /// [`Task::finally`] with explicit options.
    pub fn finally_with<F>(&self, options: ContinuationOptions, action: F) -> Task<T>
    where
        F: FnOnce() + Send + 'static,
    {
        self.try_finally_with(options, move || {
            action();
            Ok(())
        })
    }

    /// Run a fallible `action` exactly once whatever the terminal state.
    ///
    /// An error from `action` becomes the observed fault. The original fault,
    /// if any, is marked observed and discarded.
    pub fn try_finally<F>(&self, action: F) -> Task<T>
    where
        F: FnOnce() -> Result<(), Fault> + Send + 'static,
    {
        self.try_finally_with(ContinuationOptions::default(), action)
    }

    /// [`Task::try_finally`] with explicit options.
    pub fn try_finally_with<F>(&self, options: ContinuationOptions, action: F) -> Task<T>
    where
        F: FnOnce() -> Result<(), Fault> + Send + 'static,
    {
        self.continue_with(options, move |outcome| match action() {
            Ok(()) => Task::from_outcome(outcome),
            Err(fault) => Task::from_fault(fault),
        })
    }

    /// Box the result as a type-erased value.
    pub fn cast_to_object(&self) -> Task<AnyValue> {
        self.then_task_with(ContinuationOptions::synchronous(), |value| {
            Task::from_result(Arc::new(value) as AnyValue)
        })
    }

    /// Discard the result, keeping the terminal state.
    pub fn to_unit(&self) -> Task<()> {
        self.then_task_with(ContinuationOptions::synchronous(), |_| Task::completed())
    }

    /// Mirror this task's terminal state onto `target`.
    ///
    /// The returned task always completes successfully once the copy is done,
    /// even when the copied state is a fault.
    pub fn copy_result_to(&self, target: &TaskCompletionSource<T>) -> Task<()> {
        let target = target.clone();
        self.continue_with(ContinuationOptions::synchronous(), move |outcome| {
            target.try_complete(outcome);
            Task::completed()
        })
    }

    /// Mirror this task's terminal state onto a target of another type,
    /// completing it with `fallback` on success.
    pub fn copy_completion_to<U>(&self, target: &TaskCompletionSource<U>, fallback: U) -> Task<()>
    where
        U: Clone + Send + Sync + 'static,
    {
        let target = target.clone();
        self.continue_with(ContinuationOptions::synchronous(), move |outcome| {
            match outcome {
                Outcome::Completed(_) => target.try_set_result(fallback),
                Outcome::Faulted(faults) => target.try_set_faults(faults),
                Outcome::Canceled => target.try_set_canceled(),
            };
            Task::completed()
        })
    }
}

impl Task<AnyValue> {
    /// Unbox a type-erased result.
    ///
    /// A value of another type faults the returned task with
    /// [`DispatchError::InvalidCast`]; this never panics.
    pub fn cast_from_object<T>(&self) -> Task<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.then_with(ContinuationOptions::synchronous(), |value| {
            (*value).downcast_ref::<T>().cloned().ok_or_else(|| {
                Fault::new(DispatchError::InvalidCast {
                    expected: type_name::<T>(),
                })
            })
        })
    }
}

/// The faults handed to a [`Task::catch`] continuation.
///
/// Consumed by exactly one resolution verb.
pub struct CatchInfo<T> {
    faults: Vec<Fault>,
    primary: Fault,
    _result: PhantomData<fn() -> T>,
}

impl<T> CatchInfo<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn new(faults: Vec<Fault>) -> Self {
        let primary = faults.first().cloned().unwrap_or_else(|| {
            Fault::new(DispatchError::InvalidOperation(
                "a task cannot fault without an error".to_string(),
            ))
        });
        Self {
            faults,
            primary,
            _result: PhantomData,
        }
    }

    /// The first fault.
    pub fn fault(&self) -> &Fault {
        &self.primary
    }

    /// Every fault, in the order raised.
    pub fn faults(&self) -> &[Fault] {
        &self.faults
    }

    /// Recover with `value`.
    pub fn handled(self, value: T) -> CatchResult<T> {
        CatchResult::resolved(Task::from_result(value))
    }

    /// Re-fault with the same faults.
    pub fn throw(self) -> CatchResult<T> {
        CatchResult::resolved(Task::from_faults(self.faults))
    }

    /// Fault with a different error.
    pub fn throw_with<E>(self, error: E) -> CatchResult<T>
    where
        E: Into<Fault>,
    {
        CatchResult::resolved(Task::from_error(error))
    }

    /// Substitute another task, such as a retried operation.
    pub fn replace_with(self, task: Task<T>) -> CatchResult<T> {
        CatchResult::resolved(task)
    }
}

/// Resolution returned by a [`Task::catch`] continuation.
///
/// The default value carries no resolution; returning it faults the chain
/// with [`DispatchError::InvalidOperation`].
#[must_use]
pub struct CatchResult<T> {
    task: Option<Task<T>>,
}

impl<T> Default for CatchResult<T> {
    fn default() -> Self {
        Self { task: None }
    }
}

impl<T> CatchResult<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn resolved(task: Task<T>) -> Self {
        Self { task: Some(task) }
    }

    fn into_task(self) -> Task<T> {
        self.task.unwrap_or_else(|| {
            Task::from_error(DispatchError::InvalidOperation(
                MISSING_CATCH_VERB.to_string(),
            ))
        })
    }
}
