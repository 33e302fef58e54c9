//! Processor facade.

use std::sync::Arc;

use tracing::debug;

use super::{CommandWorker, Dispatcher, EventWorker};
use crate::activation::{CachingActivator, HandlerActivator};
use crate::advice::{TraceWriter, Traced};
use crate::config::ProcessorConfig;
use crate::descriptor::MessageKind;
use crate::pipeline::{Filter, FilterInfo, FilterScope};
use crate::registry::{HandlerRegistry, HandlerSelector, Registration, RegistrySelector};
use crate::request::{Envelope, Request};
use crate::services::ScopeProvider;
use crate::task::{AnyValue, CancellationToken, ContinuationOptions, Task, TaskError};
use crate::validation::{AlwaysValid, Validator};

/// Entry point for dispatching commands and events.
///
/// Every top-level call creates a root request that is disposed once the
/// returned task completes. Nested calls made from inside a handler create
/// child requests that share the root's scope.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use courier::dispatch::Processor;
/// use courier::handlers::CommandHandler;
/// use courier::registry::Registration;
/// use courier::request::Request;
/// use courier::task::Task;
///
/// struct Greet(String);
/// struct Greeter;
///
/// impl CommandHandler for Greeter {
///     type Command = Greet;
///     type Output = String;
///
///     fn handle(&self, command: &Greet, _request: &Arc<Request>) -> Task<String> {
///         Task::from_result(format!("hello {}", command.0))
///     }
/// }
///
/// let processor = Processor::builder()
///     .register(Registration::command(|_| Ok(Greeter)))
///     .build();
///
/// let greeting: String = processor.process(Greet("world".to_string())).unwrap();
/// assert_eq!(greeting, "hello world");
/// ```
pub struct Processor {
    commands: CommandWorker,
    events: EventWorker,
    scope_provider: Option<Arc<dyn ScopeProvider>>,
    config: ProcessorConfig,
}

impl Processor {
    /// Start building a processor.
    pub fn builder() -> ProcessorBuilder {
        ProcessorBuilder::new()
    }

    /// Configuration the processor was built with.
    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Worker that executes commands.
    pub fn commands(&self) -> &CommandWorker {
        &self.commands
    }

    /// Worker that publishes events.
    pub fn events(&self) -> &EventWorker {
        &self.events
    }

    /// Dispatch a command and block until it completes.
    ///
    /// Must not be called from a thread that pumps the scheduling context
    /// the dispatch continues on.
    pub fn process<M, R>(&self, command: M) -> Result<R, TaskError>
    where
        M: Send + Sync + 'static,
        R: Clone + Send + Sync + 'static,
    {
        self.process_async::<M, R>(command).wait()
    }

    /// Dispatch a command.
    pub fn process_async<M, R>(&self, command: M) -> Task<R>
    where
        M: Send + Sync + 'static,
        R: Clone + Send + Sync + 'static,
    {
        self.process_async_with(command, CancellationToken::none())
    }

    /// Dispatch a command that can be canceled before its handler runs.
    pub fn process_async_with<M, R>(&self, command: M, cancellation: CancellationToken) -> Task<R>
    where
        M: Send + Sync + 'static,
        R: Clone + Send + Sync + 'static,
    {
        let request = self.root_request(Envelope::command::<M, R>(command), cancellation);
        self.run_root(request).cast_from_object::<R>()
    }

    /// Dispatch a command nested under `parent`.
    pub fn process_child<M, R>(&self, parent: &Arc<Request>, command: M) -> Task<R>
    where
        M: Send + Sync + 'static,
        R: Clone + Send + Sync + 'static,
    {
        let request = parent.child(Envelope::command::<M, R>(command));
        self.commands.execute(&request).cast_from_object::<R>()
    }

    /// Publish an event to every handler registered for it.
    pub fn publish<M>(&self, event: M) -> Task<()>
    where
        M: Send + Sync + 'static,
    {
        let request = self.root_request(Envelope::event(event), CancellationToken::none());
        self.run_root(request).to_unit()
    }

    /// Publish an event nested under `parent`.
    pub fn publish_child<M>(&self, parent: &Arc<Request>, event: M) -> Task<()>
    where
        M: Send + Sync + 'static,
    {
        let request = parent.child(Envelope::event(event));
        self.events.execute(&request)
    }

    /// Dispatch a prepared envelope as a new root request.
    pub fn dispatch_envelope(&self, envelope: Envelope) -> Task<AnyValue> {
        let request = self.root_request(envelope, CancellationToken::none());
        self.run_root(request)
    }

    /// Dispatch an existing request by kind.
    ///
    /// The caller owns the request and is responsible for disposing it.
    #[tracing::instrument(
        name = "processor.dispatch",
        skip_all,
        fields(message = request.message_name(), kind = %request.kind())
    )]
    pub fn dispatch(&self, request: &Arc<Request>) -> Task<AnyValue> {
        debug!(correlation_id = %request.correlation_id(), "Dispatching");
        match request.kind() {
            MessageKind::Command => self.commands.execute(request),
            MessageKind::Event => self.events.execute(request).cast_to_object(),
        }
    }

    fn root_request(&self, envelope: Envelope, cancellation: CancellationToken) -> Arc<Request> {
        Request::with_options(envelope, self.scope_provider.clone(), cancellation)
    }

    fn run_root(&self, request: Arc<Request>) -> Task<AnyValue> {
        let task = self.dispatch(&request);
        task.finally_with(ContinuationOptions::synchronous(), move || request.dispose())
    }
}

/// Builder for [`Processor`].
pub struct ProcessorBuilder {
    /// Runtime configuration.
    config: ProcessorConfig,
    /// Handlers for the default registry selector.
    registrations: Vec<Registration>,
    /// Replaces the registry selector.
    selector: Option<Arc<dyn HandlerSelector>>,
    /// Replaces the caching activator.
    activator: Option<Arc<dyn HandlerActivator>>,
    validator: Option<Arc<dyn Validator>>,
    scope_provider: Option<Arc<dyn ScopeProvider>>,
    /// Filters applied to every handler, outside its own filters.
    global_filters: Vec<FilterInfo>,
    /// Wraps selector, activator and validator when set.
    trace_writer: Option<Arc<dyn TraceWriter>>,
}

impl Default for ProcessorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessorBuilder {
    /// A builder with default configuration and no handlers.
    pub fn new() -> Self {
        Self {
            config: ProcessorConfig::default(),
            registrations: Vec::new(),
            selector: None,
            activator: None,
            validator: None,
            scope_provider: None,
            global_filters: Vec::new(),
            trace_writer: None,
        }
    }

    /// Replace the configuration.
    pub fn with_config(mut self, config: ProcessorConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a handler registration.
    pub fn register(mut self, registration: Registration) -> Self {
        self.registrations.push(registration);
        self
    }

    /// Use a custom selector. Registrations are ignored when set.
    pub fn with_selector(mut self, selector: Arc<dyn HandlerSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Use a custom activator.
    pub fn with_activator(mut self, activator: Arc<dyn HandlerActivator>) -> Self {
        self.activator = Some(activator);
        self
    }

    /// Validate messages with `validator`.
    pub fn with_validator(mut self, validator: impl Validator + 'static) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Give each root request a dependency scope from `provider`.
    pub fn with_scope_provider(mut self, provider: impl ScopeProvider + 'static) -> Self {
        self.scope_provider = Some(Arc::new(provider));
        self
    }

    /// Add a global filter. Global filters run in registration order,
    /// outside every handler's own filters.
    pub fn global_filter(mut self, filter: Filter) -> Self {
        self.global_filters
            .push(FilterInfo::new(filter, FilterScope::Global));
        self
    }

    /// Trace selector, activator and validator calls through `writer`.
    pub fn with_trace_writer(mut self, writer: impl TraceWriter + 'static) -> Self {
        self.trace_writer = Some(Arc::new(writer));
        self
    }

    /// Wire the collaborators into a processor.
    pub fn build(self) -> Processor {
        let mut selector: Arc<dyn HandlerSelector> = match self.selector {
            Some(selector) => selector,
            None => {
                let mut registry = HandlerRegistry::new(self.config.default_lifetime);
                for registration in self.registrations {
                    registry.register(registration);
                }
                Arc::new(RegistrySelector::new(Arc::new(registry)))
            }
        };
        let mut activator: Arc<dyn HandlerActivator> = match self.activator {
            Some(activator) => activator,
            None => Arc::new(CachingActivator::new()),
        };
        let mut validator: Arc<dyn Validator> = match self.validator {
            Some(validator) => validator,
            None => Arc::new(AlwaysValid),
        };

        if let Some(writer) = self.trace_writer {
            selector = Arc::new(Traced::new(selector, writer.clone()));
            activator = Arc::new(Traced::new(activator, writer.clone()));
            validator = Arc::new(Traced::new(validator, writer));
        }

        let dispatcher = Arc::new(Dispatcher {
            selector,
            activator,
            validator,
            global_filters: self.global_filters,
            abort_on_invalid: self.config.abort_on_invalid_message,
        });

        Processor {
            commands: CommandWorker::new(dispatcher.clone()),
            events: EventWorker::new(dispatcher),
            scope_provider: self.scope_provider,
            config: self.config,
        }
    }
}

