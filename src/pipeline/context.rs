//! Contexts handed to filter hooks.

use std::any::Any;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::descriptor::HandlerDescriptor;
use crate::request::Request;
use crate::task::{AnyValue, Fault};

/// Outcome of the inner part of a filter chain as seen by a post-hook.
pub(crate) type Executed = Result<AnyValue, Vec<Fault>>;

/// Passed to [`HandlerFilter::on_executing`](super::HandlerFilter::on_executing).
pub struct ExecutingContext {
    request: Arc<Request>,
    descriptor: Arc<HandlerDescriptor>,
    result: Option<AnyValue>,
}

impl ExecutingContext {
    pub(crate) fn new(request: Arc<Request>, descriptor: Arc<HandlerDescriptor>) -> Self {
        Self {
            request,
            descriptor,
            result: None,
        }
    }

    /// The request being dispatched.
    pub fn request(&self) -> &Arc<Request> {
        &self.request
    }

    /// Descriptor of the handler being run.
    pub fn descriptor(&self) -> &Arc<HandlerDescriptor> {
        &self.descriptor
    }

    /// Short-circuit the chain with `value`.
    ///
    /// The handler and every more specific filter are skipped. Post-hooks of
    /// filters already entered still run.
    pub fn set_result<V>(&mut self, value: V)
    where
        V: Any + Send + Sync,
    {
        self.result = Some(Arc::new(value));
    }

    /// Returns true if a filter short-circuited.
    pub fn has_result(&self) -> bool {
        self.result.is_some()
    }

    pub(crate) fn into_parts(self) -> (Arc<Request>, Arc<HandlerDescriptor>, Option<AnyValue>) {
        (self.request, self.descriptor, self.result)
    }
}

/// Passed to [`HandlerFilter::on_executed`](super::HandlerFilter::on_executed).
pub struct ExecutedContext {
    request: Arc<Request>,
    descriptor: Arc<HandlerDescriptor>,
    outcome: Executed,
    short_circuited: bool,
}

impl ExecutedContext {
    pub(crate) fn new(
        request: Arc<Request>,
        descriptor: Arc<HandlerDescriptor>,
        outcome: Executed,
        short_circuited: bool,
    ) -> Self {
        Self {
            request,
            descriptor,
            outcome,
            short_circuited,
        }
    }

    /// The request being dispatched.
    pub fn request(&self) -> &Arc<Request> {
        &self.request
    }

    /// Descriptor of the handler that ran.
    pub fn descriptor(&self) -> &Arc<HandlerDescriptor> {
        &self.descriptor
    }

    /// The produced result, if the inner chain succeeded.
    pub fn result(&self) -> Option<&AnyValue> {
        self.outcome.as_ref().ok()
    }

    /// The produced result as `V`.
    pub fn result_as<V: 'static>(&self) -> Option<&V> {
        self.result().and_then(|value| value.downcast_ref::<V>())
    }

    /// Faults raised by the inner chain. Empty on success.
    pub fn faults(&self) -> &[Fault] {
        match &self.outcome {
            Ok(_) => &[],
            Err(faults) => faults,
        }
    }

    /// The primary fault, if the chain faulted.
    pub fn fault(&self) -> Option<&Fault> {
        self.faults().first()
    }

    /// Returns true if the inner chain faulted.
    pub fn is_faulted(&self) -> bool {
        self.outcome.is_err()
    }

    /// True if a pre-hook produced the result instead of the handler.
    pub fn was_short_circuited(&self) -> bool {
        self.short_circuited
    }

    /// Replace the outcome with `value`, discarding any fault.
    ///
    /// Abort faults are re-raised regardless.
    pub fn set_result<V>(&mut self, value: V)
    where
        V: Any + Send + Sync,
    {
        self.outcome = Ok(Arc::new(value));
    }

    pub(crate) fn into_outcome(self) -> Executed {
        self.outcome
    }
}

/// Passed to [`ExceptionFilter::on_exception`](super::ExceptionFilter::on_exception).
///
/// Shared by every exception filter of one dispatch, so a filter can see
/// whether an earlier one already handled the fault.
pub struct ExceptionContext {
    request: Arc<Request>,
    descriptor: Arc<HandlerDescriptor>,
    faults: Vec<Fault>,
    result: Mutex<Option<AnyValue>>,
}

impl ExceptionContext {
    pub(crate) fn new(
        request: Arc<Request>,
        descriptor: Arc<HandlerDescriptor>,
        faults: Vec<Fault>,
    ) -> Self {
        Self {
            request,
            descriptor,
            faults,
            result: Mutex::new(None),
        }
    }

    /// The request being dispatched.
    pub fn request(&self) -> &Arc<Request> {
        &self.request
    }

    /// Descriptor of the handler that faulted.
    pub fn descriptor(&self) -> &Arc<HandlerDescriptor> {
        &self.descriptor
    }

    /// The primary fault.
    pub fn fault(&self) -> Option<&Fault> {
        self.faults.first()
    }

    /// Every fault, in the order raised.
    pub fn faults(&self) -> &[Fault] {
        &self.faults
    }

    /// Mark the fault handled, completing the dispatch with `value`.
    pub fn set_result<V>(&self, value: V)
    where
        V: Any + Send + Sync,
    {
        *self.result.lock() = Some(Arc::new(value));
    }

    /// Returns true once a filter supplied a replacement result.
    pub fn is_handled(&self) -> bool {
        self.result.lock().is_some()
    }

    pub(crate) fn take_result(&self) -> Option<AnyValue> {
        self.result.lock().take()
    }
}
