//! Trace-writer advice.

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::activation::HandlerActivator;
use crate::descriptor::{HandlerDescriptor, HandlerInstance};
use crate::error::DispatchError;
use crate::registry::HandlerSelector;
use crate::request::Request;
use crate::validation::Validator;

/// Receives trace records from [`Traced`] collaborators.
pub trait TraceWriter: Send + Sync {
    fn begin(&self, operation: &'static str, subject: &str);

    fn end(&self, operation: &'static str, subject: &str, elapsed: Duration);

    fn error(&self, operation: &'static str, subject: &str, error: &dyn StdError);
}

/// Forwards trace records to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingWriter;

impl TraceWriter for TracingWriter {
    fn begin(&self, operation: &'static str, subject: &str) {
        debug!(operation, subject, "begin");
    }

    fn end(&self, operation: &'static str, subject: &str, elapsed: Duration) {
        debug!(operation, subject, elapsed_us = elapsed.as_micros() as u64, "end");
    }

    fn error(&self, operation: &'static str, subject: &str, error: &dyn StdError) {
        warn!(operation, subject, error = %error, "error");
    }
}

/// Wrapper that traces every call to the wrapped collaborator.
///
/// Contracts of the wrapped collaborator are unchanged.
pub struct Traced<T> {
    inner: T,
    writer: Arc<dyn TraceWriter>,
}

impl<T> Traced<T> {
    /// Wrap `inner`, reporting to `writer`.
    pub fn new(inner: T, writer: Arc<dyn TraceWriter>) -> Self {
        Self { inner, writer }
    }

    /// The wrapped collaborator.
    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// Unwrap the collaborator.
    pub fn into_inner(self) -> T {
        self.inner
    }

    fn trace<R>(
        &self,
        operation: &'static str,
        subject: &str,
        call: impl FnOnce() -> Result<R, DispatchError>,
    ) -> Result<R, DispatchError> {
        self.writer.begin(operation, subject);
        let start = Instant::now();
        let result = call();
        if let Err(e) = &result {
            self.writer.error(operation, subject, e);
        }
        self.writer.end(operation, subject, start.elapsed());
        result
    }
}

impl<T: HandlerSelector> HandlerSelector for Traced<T> {
    fn select_handler(&self, request: &Request) -> Result<Arc<HandlerDescriptor>, DispatchError> {
        self.trace("select_handler", request.message_name(), || {
            self.inner.select_handler(request)
        })
    }

    fn select_handlers(&self, request: &Request) -> Vec<Arc<HandlerDescriptor>> {
        self.trace("select_handlers", request.message_name(), || {
            Ok(self.inner.select_handlers(request))
        })
        .unwrap_or_default()
    }
}

impl<T: HandlerActivator> HandlerActivator for Traced<T> {
    fn create(
        &self,
        request: &Arc<Request>,
        descriptor: &Arc<HandlerDescriptor>,
    ) -> Result<HandlerInstance, DispatchError> {
        self.trace("activate", descriptor.handler_name(), || {
            self.inner.create(request, descriptor)
        })
    }
}

impl<T: Validator> Validator for Traced<T> {
    fn validate(&self, request: &Request) -> bool {
        self.trace("validate", request.message_name(), || {
            Ok(self.inner.validate(request))
        })
        .unwrap_or(false)
    }
}
