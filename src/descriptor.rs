//! Handler descriptors.
//!
//! A descriptor is resolved once per registered handler and never changes
//! afterwards, except for its property bag and singleton slot.

use std::any::TypeId;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use serde::Deserialize;

use crate::pipeline::FilterInfo;
use crate::request::Request;
use crate::task::{AnyValue, Fault, Task};

/// A type-erased handler instance.
pub type HandlerInstance = AnyValue;

pub(crate) type HandlerFactory =
    Arc<dyn Fn(&Arc<Request>) -> Result<HandlerInstance, Fault> + Send + Sync>;
pub(crate) type HandlerInvoker =
    Arc<dyn Fn(&HandlerInstance, &Arc<Request>) -> Task<AnyValue> + Send + Sync>;
pub(crate) type DefaultResult = Arc<dyn Fn() -> AnyValue + Send + Sync>;

/// Process-unique descriptor identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DescriptorId(u64);

impl DescriptorId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        DescriptorId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric identity.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for DescriptorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How long an activated handler instance lives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerLifetime {
    /// A new instance for every dispatch.
    #[default]
    Transient,
    /// One instance per request tree.
    Scoped,
    /// One instance per descriptor.
    Singleton,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Command,
    Event,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Command => f.write_str("command"),
            MessageKind::Event => f.write_str("event"),
        }
    }
}

/// Metadata for one registered handler.
pub struct HandlerDescriptor {
    id: DescriptorId,
    kind: MessageKind,
    message_type: TypeId,
    message_name: &'static str,
    handler_name: &'static str,
    result_name: &'static str,
    lifetime: HandlerLifetime,
    filters: Vec<FilterInfo>,
    properties: DashMap<String, AnyValue>,
    singleton: OnceLock<HandlerInstance>,
    factory: HandlerFactory,
    invoker: HandlerInvoker,
    default_result: DefaultResult,
}

pub(crate) struct DescriptorParts {
    pub kind: MessageKind,
    pub message_type: TypeId,
    pub message_name: &'static str,
    pub handler_name: &'static str,
    pub result_name: &'static str,
    pub lifetime: HandlerLifetime,
    pub filters: Vec<FilterInfo>,
    pub properties: Vec<(String, AnyValue)>,
    pub factory: HandlerFactory,
    pub invoker: HandlerInvoker,
    pub default_result: DefaultResult,
}

impl HandlerDescriptor {
    pub(crate) fn new(parts: DescriptorParts) -> Self {
        Self {
            id: DescriptorId::next(),
            kind: parts.kind,
            message_type: parts.message_type,
            message_name: parts.message_name,
            handler_name: parts.handler_name,
            result_name: parts.result_name,
            lifetime: parts.lifetime,
            filters: parts.filters,
            properties: parts.properties.into_iter().collect(),
            singleton: OnceLock::new(),
            factory: parts.factory,
            invoker: parts.invoker,
            default_result: parts.default_result,
        }
    }

    /// Identity assigned at registration.
    pub fn id(&self) -> DescriptorId {
        self.id
    }

    /// Whether this handles a command or an event.
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// `TypeId` of the handled message.
    pub fn message_type(&self) -> TypeId {
        self.message_type
    }

    /// Type name of the handled message.
    pub fn message_name(&self) -> &'static str {
        self.message_name
    }

    /// Type name of the handler.
    pub fn handler_name(&self) -> &'static str {
        self.handler_name
    }

    /// Type name of the handler's result.
    pub fn result_name(&self) -> &'static str {
        self.result_name
    }

    /// Resolved instance lifetime.
    pub fn lifetime(&self) -> HandlerLifetime {
        self.lifetime
    }

    /// Handler-scoped filters in registration order.
    pub fn filters(&self) -> &[FilterInfo] {
        &self.filters
    }

    /// Read a property as `V`.
    pub fn property<V>(&self, key: &str) -> Option<Arc<V>>
    where
        V: Send + Sync + 'static,
    {
        self.properties
            .get(key)
            .and_then(|value| value.clone().downcast::<V>().ok())
    }

    /// Read a property, storing the value from `init` if it is missing.
    ///
    /// Concurrent callers may both run `init`; exactly one value is kept.
    pub fn property_or_insert_with<V, F>(&self, key: &str, init: F) -> Option<Arc<V>>
    where
        V: Send + Sync + 'static,
        F: FnOnce() -> V,
    {
        if let Some(value) = self.property::<V>(key) {
            return Some(value);
        }
        let value: AnyValue = Arc::new(init());
        self.properties
            .entry(key.to_string())
            .or_insert(value)
            .clone()
            .downcast::<V>()
            .ok()
    }

    /// Store a property, replacing any previous value.
    pub fn set_property<V>(&self, key: impl Into<String>, value: V)
    where
        V: Send + Sync + 'static,
    {
        self.properties.insert(key.into(), Arc::new(value));
    }

    pub(crate) fn create_instance(&self, request: &Arc<Request>) -> Result<HandlerInstance, Fault> {
        (self.factory)(request)
    }

    pub(crate) fn singleton_slot(&self) -> &OnceLock<HandlerInstance> {
        &self.singleton
    }

    pub(crate) fn invoke(&self, handler: &HandlerInstance, request: &Arc<Request>) -> Task<AnyValue> {
        (self.invoker)(handler, request)
    }

    /// The handler's default result, used when a dispatch is aborted.
    pub fn default_result(&self) -> AnyValue {
        (self.default_result)()
    }
}

impl fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("message", &self.message_name)
            .field("handler", &self.handler_name)
            .field("lifetime", &self.lifetime)
            .field("filters", &self.filters.len())
            .finish()
    }
}
