//! Filter pipeline engine.
//!
//! A dispatch runs its handler inside an onion of filters. Filters are
//! listed least specific first (global filters, then handler filters, each
//! in registration order). The list is reversed and folded around the
//! handler invocation, so the first filter sees the outermost pre and post
//! events and the last sees the innermost:
//!
//! ```text
//! global.pre -> handler.pre -> HANDLER -> handler.post -> global.post
//! ```
//!
//! Exception filters run only if the whole chain ends faulted, most
//! recently registered first.

mod context;

pub use context::{ExceptionContext, ExecutedContext, ExecutingContext};

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::descriptor::HandlerDescriptor;
use crate::request::Request;
use crate::task::{guard, guard_result, iterate, AnyValue, Fault, Task};
use context::Executed;

/// Runs around handler execution.
pub trait HandlerFilter: Send + Sync {
    /// Called before the inner chain. Setting a result short-circuits it.
    fn on_executing(&self, _context: &mut ExecutingContext) -> Result<(), Fault> {
        Ok(())
    }

    /// Called with the inner chain's result or fault. Not called for a
    /// canceled chain.
    fn on_executed(&self, _context: &mut ExecutedContext) -> Result<(), Fault> {
        Ok(())
    }
}

/// Runs when the filter chain ends faulted.
pub trait ExceptionFilter: Send + Sync {
    fn on_exception(&self, context: &Arc<ExceptionContext>) -> Task<()>;
}

/// A filter of either capability.
#[derive(Clone)]
pub enum Filter {
    Handler(Arc<dyn HandlerFilter>),
    Exception(Arc<dyn ExceptionFilter>),
}

impl Filter {
    /// Wrap a handler filter.
    pub fn handler(filter: impl HandlerFilter + 'static) -> Self {
        Filter::Handler(Arc::new(filter))
    }

    /// Wrap an exception filter.
    pub fn exception(filter: impl ExceptionFilter + 'static) -> Self {
        Filter::Exception(Arc::new(filter))
    }
}

/// Where a filter was registered. Informational only; ordering comes from
/// list position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterScope {
    Global,
    Handler,
}

/// A filter together with its registration scope.
#[derive(Clone)]
pub struct FilterInfo {
    pub filter: Filter,
    pub scope: FilterScope,
}

impl FilterInfo {
    /// Pair `filter` with the scope it was registered in.
    pub fn new(filter: Filter, scope: FilterScope) -> Self {
        Self { filter, scope }
    }
}

impl fmt::Debug for FilterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.filter {
            Filter::Handler(_) => "handler",
            Filter::Exception(_) => "exception",
        };
        f.debug_struct("FilterInfo")
            .field("kind", &kind)
            .field("scope", &self.scope)
            .finish()
    }
}

type Continuation = Box<dyn FnOnce() -> Task<AnyValue> + Send>;

/// An ordered filter list ready to wrap a handler invocation.
pub struct FilterPipeline {
    handler_filters: Vec<Arc<dyn HandlerFilter>>,
    exception_filters: Vec<Arc<dyn ExceptionFilter>>,
}

impl FilterPipeline {
    /// Build from filters listed least specific first.
    pub fn new<'a, I>(filters: I) -> Self
    where
        I: IntoIterator<Item = &'a FilterInfo>,
    {
        let mut handler_filters = Vec::new();
        let mut exception_filters = Vec::new();
        for info in filters {
            match &info.filter {
                Filter::Handler(filter) => handler_filters.push(filter.clone()),
                Filter::Exception(filter) => exception_filters.push(filter.clone()),
            }
        }
        Self {
            handler_filters,
            exception_filters,
        }
    }

    /// Run `handler` inside the filter chain.
    ///
    /// Panics in hooks and in `handler` become faults.
    pub fn invoke<F>(
        &self,
        request: &Arc<Request>,
        descriptor: &Arc<HandlerDescriptor>,
        handler: F,
    ) -> Task<AnyValue>
    where
        F: FnOnce() -> Task<AnyValue> + Send + 'static,
    {
        debug!(
            handler = descriptor.handler_name(),
            handler_filters = self.handler_filters.len(),
            exception_filters = self.exception_filters.len(),
            "Invoking filter pipeline"
        );

        let seed: Continuation = Box::new(handler);
        let chain = self
            .handler_filters
            .iter()
            .rev()
            .fold(seed, |next, filter| {
                let filter = filter.clone();
                let request = request.clone();
                let descriptor = descriptor.clone();
                let wrapped: Continuation =
                    Box::new(move || run_filter(filter, request, descriptor, next));
                wrapped
            });

        let task = guard(chain);
        self.handle_exceptions(task, request, descriptor)
    }

    fn handle_exceptions(
        &self,
        task: Task<AnyValue>,
        request: &Arc<Request>,
        descriptor: &Arc<HandlerDescriptor>,
    ) -> Task<AnyValue> {
        if self.exception_filters.is_empty() {
            return task;
        }

        let filters = self.exception_filters.clone();
        let request = request.clone();
        let descriptor = descriptor.clone();
        task.catch(move |info| {
            if info.faults().iter().any(Fault::is_abort) {
                return info.throw();
            }

            let faults = info.faults().to_vec();
            let context = Arc::new(ExceptionContext::new(request, descriptor, faults.clone()));
            let shared = context.clone();
            let steps = filters.into_iter().rev().map(move |filter| {
                let context = shared.clone();
                guard(move || filter.on_exception(&context))
            });

            let resolved = iterate(steps, None).then_task(move |()| match context.take_result() {
                Some(value) => {
                    debug!("Exception handled by filter");
                    Task::from_result(value)
                }
                None => Task::from_faults(faults),
            });
            info.replace_with(resolved)
        })
    }
}

/// One layer of the onion: pre-hook, inner chain, post-hook.
fn run_filter(
    filter: Arc<dyn HandlerFilter>,
    request: Arc<Request>,
    descriptor: Arc<HandlerDescriptor>,
    next: Continuation,
) -> Task<AnyValue> {
    let mut executing = ExecutingContext::new(request, descriptor);
    if let Err(fault) = guard_result(|| filter.on_executing(&mut executing)) {
        return Task::from_fault(fault);
    }

    let (request, descriptor, short_circuit) = executing.into_parts();
    let short_circuited = short_circuit.is_some();
    let inner = match short_circuit {
        Some(result) => Task::from_result(result),
        None => guard(next),
    };

    inner
        .map(|value| -> Executed { Ok(value) })
        .catch(|info| {
            let faults = info.faults().to_vec();
            info.handled(Err(faults))
        })
        .then_task(move |outcome| {
            let abort = match &outcome {
                Err(faults) => faults.iter().find(|fault| fault.is_abort()).cloned(),
                Ok(_) => None,
            };

            let mut executed = ExecutedContext::new(request, descriptor, outcome, short_circuited);
            let hook = guard_result(|| filter.on_executed(&mut executed));

            if let Some(abort) = abort {
                return Task::from_fault(abort);
            }
            if let Err(fault) = hook {
                return Task::from_fault(fault);
            }
            match executed.into_outcome() {
                Ok(value) => Task::from_result(value),
                Err(faults) => Task::from_faults(faults),
            }
        })
}
