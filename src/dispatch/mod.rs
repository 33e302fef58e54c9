//! Dispatch core.
//!
//! A command goes through selection, activation, validation and the filter
//! pipeline, in that order, and yields exactly one result. An event is
//! validated once and then runs through the pipeline of every handler
//! registered for it.

mod processor;

pub use processor::{Processor, ProcessorBuilder};

use std::sync::Arc;

use tracing::{debug, warn};

use crate::activation::HandlerActivator;
use crate::descriptor::{HandlerDescriptor, HandlerInstance};
use crate::pipeline::{FilterInfo, FilterPipeline};
use crate::registry::HandlerSelector;
use crate::request::Request;
use crate::task::{when_all, AnyValue, Task};
use crate::validation::Validator;

/// Collaborators shared by the command and event workers.
pub(crate) struct Dispatcher {
    pub selector: Arc<dyn HandlerSelector>,
    pub activator: Arc<dyn HandlerActivator>,
    pub validator: Arc<dyn Validator>,
    pub global_filters: Vec<FilterInfo>,
    pub abort_on_invalid: bool,
}

impl Dispatcher {
    /// Returns false if the dispatch must stop with a default result.
    fn validate(&self, request: &Arc<Request>) -> bool {
        if self.validator.validate(request) {
            return true;
        }

        let failures = request.validation_failures();
        if self.abort_on_invalid {
            warn!(
                message = request.message_name(),
                failures = failures.len(),
                "Invalid message, aborting dispatch"
            );
            return false;
        }
        debug!(
            message = request.message_name(),
            failures = failures.len(),
            "Invalid message, continuing with validation failures attached"
        );
        true
    }

    /// Activate and run one handler. Used for event fan-out, where the
    /// message was already validated.
    fn run_handler(
        &self,
        request: &Arc<Request>,
        descriptor: &Arc<HandlerDescriptor>,
    ) -> Task<AnyValue> {
        if request.cancellation().is_cancellation_requested() {
            return Task::canceled();
        }
        match self.activator.create(request, descriptor) {
            Ok(handler) => self.invoke(request, descriptor, handler),
            Err(e) => Task::from_error(e),
        }
    }

    /// Run an activated handler inside the global and handler filters.
    fn invoke(
        &self,
        request: &Arc<Request>,
        descriptor: &Arc<HandlerDescriptor>,
        handler: HandlerInstance,
    ) -> Task<AnyValue> {
        let pipeline = FilterPipeline::new(self.global_filters.iter().chain(descriptor.filters()));
        let invoke_descriptor = descriptor.clone();
        let invoke_request = request.clone();
        pipeline.invoke(request, descriptor, move || {
            invoke_descriptor.invoke(&handler, &invoke_request)
        })
    }
}

/// Executes commands.
#[derive(Clone)]
pub struct CommandWorker {
    dispatcher: Arc<Dispatcher>,
}

impl CommandWorker {
    pub(crate) fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Run the single handler for the request's command.
    ///
    /// Fails with `HandlerNotFound` or `AmbiguousHandler` before any filter
    /// runs.
    pub fn execute(&self, request: &Arc<Request>) -> Task<AnyValue> {
        let dispatcher = &self.dispatcher;
        let descriptor = match dispatcher.selector.select_handler(request) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                debug!(message = request.message_name(), error = %e, "Handler selection failed");
                return Task::from_error(e);
            }
        };

        if request.cancellation().is_cancellation_requested() {
            return Task::canceled();
        }

        let handler = match dispatcher.activator.create(request, &descriptor) {
            Ok(handler) => handler,
            Err(e) => return Task::from_error(e),
        };

        if !dispatcher.validate(request) {
            return Task::from_result(descriptor.default_result());
        }

        dispatcher.invoke(request, &descriptor, handler)
    }
}

/// Publishes events to every registered handler.
#[derive(Clone)]
pub struct EventWorker {
    dispatcher: Arc<Dispatcher>,
}

impl EventWorker {
    pub(crate) fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Run every handler for the request's event.
    ///
    /// Handlers run concurrently, each in its own pipeline. Faults from all
    /// of them are aggregated. No handlers is not an error.
    pub fn execute(&self, request: &Arc<Request>) -> Task<()> {
        let dispatcher = &self.dispatcher;
        let descriptors = dispatcher.selector.select_handlers(request);
        if descriptors.is_empty() {
            debug!(message = request.message_name(), "No handlers for event");
            return Task::completed();
        }

        if !dispatcher.validate(request) {
            return Task::completed();
        }

        let tasks = descriptors
            .iter()
            .map(|descriptor| dispatcher.run_handler(request, descriptor))
            .collect();
        when_all(tasks).to_unit()
    }
}
