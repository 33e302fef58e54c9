//! Explicit handler registry.
//!
//! Handlers are registered up front against the message type they handle.
//! Selection maps a request's message type to its descriptors; absence and
//! ambiguity are reported when a command is dispatched.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::descriptor::{
    DefaultResult, DescriptorParts, HandlerDescriptor, HandlerFactory, HandlerInstance,
    HandlerInvoker, HandlerLifetime, MessageKind,
};
use crate::error::DispatchError;
use crate::handlers::{CommandHandler, EventHandler};
use crate::pipeline::{ExceptionFilter, Filter, FilterInfo, FilterScope, HandlerFilter};
use crate::request::Request;
use crate::task::{AnyValue, Fault, Task};

/// A handler registration under construction.
///
/// ```
/// use std::sync::Arc;
/// use courier::handlers::CommandHandler;
/// use courier::registry::Registration;
/// use courier::request::Request;
/// use courier::task::Task;
/// use courier::HandlerLifetime;
///
/// struct Add(u32, u32);
/// struct Adder;
///
/// impl CommandHandler for Adder {
///     type Command = Add;
///     type Output = u32;
///
///     fn handle(&self, command: &Add, _request: &Arc<Request>) -> Task<u32> {
///         Task::from_result(command.0 + command.1)
///     }
/// }
///
/// let registration = Registration::command(|_| Ok(Adder)).lifetime(HandlerLifetime::Singleton);
/// # let _ = registration;
/// ```
pub struct Registration {
    kind: MessageKind,
    message_type: TypeId,
    message_name: &'static str,
    handler_name: &'static str,
    result_name: &'static str,
    lifetime: Option<HandlerLifetime>,
    filters: Vec<FilterInfo>,
    properties: Vec<(String, AnyValue)>,
    factory: HandlerFactory,
    invoker: HandlerInvoker,
    default_result: DefaultResult,
}

impl Registration {
    /// Register a command handler built by `factory`.
    pub fn command<H, F>(factory: F) -> Self
    where
        H: CommandHandler,
        F: Fn(&Arc<Request>) -> Result<H, Fault> + Send + Sync + 'static,
    {
        let invoker: HandlerInvoker = Arc::new(|handler: &HandlerInstance, request: &Arc<Request>| {
            let Some(handler) = handler.downcast_ref::<H>() else {
                return Task::from_error(DispatchError::InvalidCast {
                    expected: type_name::<H>(),
                });
            };
            let Some(command) = request.message::<H::Command>() else {
                return Task::from_error(DispatchError::InvalidCast {
                    expected: type_name::<H::Command>(),
                });
            };
            handler.handle(command, request).cast_to_object()
        });

        Self {
            kind: MessageKind::Command,
            message_type: TypeId::of::<H::Command>(),
            message_name: type_name::<H::Command>(),
            handler_name: type_name::<H>(),
            result_name: type_name::<H::Output>(),
            lifetime: None,
            filters: Vec::new(),
            properties: Vec::new(),
            factory: erase_factory(factory),
            invoker,
            default_result: Arc::new(|| Arc::new(H::Output::default()) as AnyValue),
        }
    }

    /// Register an event handler built by `factory`.
    pub fn event<H, F>(factory: F) -> Self
    where
        H: EventHandler,
        F: Fn(&Arc<Request>) -> Result<H, Fault> + Send + Sync + 'static,
    {
        let invoker: HandlerInvoker = Arc::new(|handler: &HandlerInstance, request: &Arc<Request>| {
            let Some(handler) = handler.downcast_ref::<H>() else {
                return Task::from_error(DispatchError::InvalidCast {
                    expected: type_name::<H>(),
                });
            };
            let Some(event) = request.message::<H::Event>() else {
                return Task::from_error(DispatchError::InvalidCast {
                    expected: type_name::<H::Event>(),
                });
            };
            handler.handle(event, request).cast_to_object()
        });

        Self {
            kind: MessageKind::Event,
            message_type: TypeId::of::<H::Event>(),
            message_name: type_name::<H::Event>(),
            handler_name: type_name::<H>(),
            result_name: type_name::<()>(),
            lifetime: None,
            filters: Vec::new(),
            properties: Vec::new(),
            factory: erase_factory(factory),
            invoker,
            default_result: Arc::new(|| Arc::new(()) as AnyValue),
        }
    }

    /// Override the registry's default lifetime.
    pub fn lifetime(mut self, lifetime: HandlerLifetime) -> Self {
        self.lifetime = Some(lifetime);
        self
    }

    /// Add a handler-scoped filter. Filters run in registration order.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(FilterInfo::new(filter, FilterScope::Handler));
        self
    }

    /// Add a handler-scoped [`HandlerFilter`].
    pub fn handler_filter(self, filter: impl HandlerFilter + 'static) -> Self {
        self.filter(Filter::Handler(Arc::new(filter)))
    }

    /// Add a handler-scoped [`ExceptionFilter`].
    pub fn exception_filter(self, filter: impl ExceptionFilter + 'static) -> Self {
        self.filter(Filter::Exception(Arc::new(filter)))
    }

    /// Attach a custom property to the descriptor.
    pub fn property<V>(mut self, key: impl Into<String>, value: V) -> Self
    where
        V: Any + Send + Sync,
    {
        self.properties.push((key.into(), Arc::new(value)));
        self
    }

    fn into_descriptor(self, default_lifetime: HandlerLifetime) -> HandlerDescriptor {
        HandlerDescriptor::new(DescriptorParts {
            kind: self.kind,
            message_type: self.message_type,
            message_name: self.message_name,
            handler_name: self.handler_name,
            result_name: self.result_name,
            lifetime: self.lifetime.unwrap_or(default_lifetime),
            filters: self.filters,
            properties: self.properties,
            factory: self.factory,
            invoker: self.invoker,
            default_result: self.default_result,
        })
    }
}

fn erase_factory<H, F>(factory: F) -> HandlerFactory
where
    H: Send + Sync + 'static,
    F: Fn(&Arc<Request>) -> Result<H, Fault> + Send + Sync + 'static,
{
    Arc::new(move |request: &Arc<Request>| {
        factory(request).map(|handler| Arc::new(handler) as HandlerInstance)
    })
}

/// Descriptors keyed by message type.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    default_lifetime: HandlerLifetime,
    descriptors: HashMap<TypeId, Vec<Arc<HandlerDescriptor>>>,
}

impl HandlerRegistry {
    /// An empty registry. Registrations without an explicit lifetime get
    /// `default_lifetime`.
    pub fn new(default_lifetime: HandlerLifetime) -> Self {
        Self {
            default_lifetime,
            descriptors: HashMap::new(),
        }
    }

    /// Resolve `registration` into a descriptor and index it.
    pub fn register(&mut self, registration: Registration) -> Arc<HandlerDescriptor> {
        let descriptor = Arc::new(registration.into_descriptor(self.default_lifetime));
        debug!(
            id = %descriptor.id(),
            kind = %descriptor.kind(),
            message = descriptor.message_name(),
            handler = descriptor.handler_name(),
            lifetime = ?descriptor.lifetime(),
            "Registered handler"
        );
        self.descriptors
            .entry(descriptor.message_type())
            .or_default()
            .push(descriptor.clone());
        descriptor
    }

    /// Descriptors of `kind` registered for `message_type`.
    pub fn descriptors(&self, message_type: TypeId, kind: MessageKind) -> Vec<Arc<HandlerDescriptor>> {
        self.descriptors
            .get(&message_type)
            .map(|all| {
                all.iter()
                    .filter(|descriptor| descriptor.kind() == kind)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of registered descriptors.
    pub fn len(&self) -> usize {
        self.descriptors.values().map(Vec::len).sum()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

/// Chooses the handlers for a request.
pub trait HandlerSelector: Send + Sync {
    /// The single handler for a command.
    fn select_handler(&self, request: &Request) -> Result<Arc<HandlerDescriptor>, DispatchError>;

    /// Every handler for an event. May be empty.
    fn select_handlers(&self, request: &Request) -> Vec<Arc<HandlerDescriptor>>;
}

impl<T: HandlerSelector + ?Sized> HandlerSelector for Arc<T> {
    fn select_handler(&self, request: &Request) -> Result<Arc<HandlerDescriptor>, DispatchError> {
        (**self).select_handler(request)
    }

    fn select_handlers(&self, request: &Request) -> Vec<Arc<HandlerDescriptor>> {
        (**self).select_handlers(request)
    }
}

/// Selects handlers from a [`HandlerRegistry`].
#[derive(Debug, Clone)]
pub struct RegistrySelector {
    registry: Arc<HandlerRegistry>,
}

impl RegistrySelector {
    /// Selector over a built registry.
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }
}

impl HandlerSelector for RegistrySelector {
    fn select_handler(&self, request: &Request) -> Result<Arc<HandlerDescriptor>, DispatchError> {
        let mut candidates = self
            .registry
            .descriptors(request.message_type(), request.kind());
        match candidates.len() {
            0 => Err(DispatchError::HandlerNotFound {
                message_type: request.message_name(),
            }),
            1 => Ok(candidates.remove(0)),
            count => Err(DispatchError::AmbiguousHandler {
                message_type: request.message_name(),
                count,
            }),
        }
    }

    fn select_handlers(&self, request: &Request) -> Vec<Arc<HandlerDescriptor>> {
        self.registry
            .descriptors(request.message_type(), request.kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Envelope;

    struct Ping;
    struct Pong;

    struct PingHandler;

    impl CommandHandler for PingHandler {
        type Command = Ping;
        type Output = &'static str;

        fn handle(&self, _command: &Ping, _request: &Arc<Request>) -> Task<&'static str> {
            Task::from_result("pong")
        }
    }

    struct PingAudit;

    impl EventHandler for PingAudit {
        type Event = Ping;

        fn handle(&self, _event: &Ping, _request: &Arc<Request>) -> Task<()> {
            Task::completed()
        }
    }

    fn selector(registrations: Vec<Registration>) -> RegistrySelector {
        let mut registry = HandlerRegistry::new(HandlerLifetime::Transient);
        for registration in registrations {
            registry.register(registration);
        }
        RegistrySelector::new(Arc::new(registry))
    }

    #[test]
    fn test_select_single_command_handler() {
        let selector = selector(vec![Registration::command(|_| Ok(PingHandler))]);
        let request = Request::new(Envelope::command::<_, &'static str>(Ping));

        let descriptor = selector.select_handler(&request).unwrap();
        assert_eq!(descriptor.handler_name(), type_name::<PingHandler>());
        assert_eq!(descriptor.lifetime(), HandlerLifetime::Transient);
    }

    #[test]
    fn test_missing_handler_is_not_found() {
        let selector = selector(vec![Registration::command(|_| Ok(PingHandler))]);
        let request = Request::new(Envelope::command::<_, ()>(Pong));

        let err = selector.select_handler(&request).unwrap_err();
        assert!(matches!(err, DispatchError::HandlerNotFound { .. }));
    }

    #[test]
    fn test_two_command_handlers_are_ambiguous() {
        let selector = selector(vec![
            Registration::command(|_| Ok(PingHandler)),
            Registration::command(|_| Ok(PingHandler)),
        ]);
        let request = Request::new(Envelope::command::<_, &'static str>(Ping));

        let err = selector.select_handler(&request).unwrap_err();
        assert!(matches!(
            err,
            DispatchError::AmbiguousHandler { count: 2, .. }
        ));
    }

    #[test]
    fn test_event_handlers_do_not_satisfy_commands() {
        let selector = selector(vec![
            Registration::event(|_| Ok(PingAudit)),
            Registration::event(|_| Ok(PingAudit)),
        ]);
        let command = Request::new(Envelope::command::<_, ()>(Ping));
        let event = Request::new(Envelope::event(Ping));

        assert!(selector.select_handler(&command).is_err());
        assert_eq!(selector.select_handlers(&event).len(), 2);
    }

    #[test]
    fn test_registration_properties_and_lifetime() {
        let mut registry = HandlerRegistry::new(HandlerLifetime::Scoped);
        let defaulted = registry.register(Registration::command(|_| Ok(PingHandler)));
        let explicit = registry.register(
            Registration::event(|_| Ok(PingAudit))
                .lifetime(HandlerLifetime::Singleton)
                .property("audit", true),
        );

        assert_eq!(defaulted.lifetime(), HandlerLifetime::Scoped);
        assert_eq!(explicit.lifetime(), HandlerLifetime::Singleton);
        assert_eq!(explicit.property::<bool>("audit").as_deref(), Some(&true));
        assert_eq!(registry.len(), 2);
    }
}
