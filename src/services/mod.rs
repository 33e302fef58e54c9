//! Dependency scope provider.
//!
//! Handlers and filters reach shared services through the scope attached to
//! the root of their request tree. [`ServiceRegistry`] is the in-process
//! provider: singletons are cached behind a reader/writer lock so lookups
//! run concurrently, and re-registering a service invalidates its cached
//! instance.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::task::AnyValue;

/// Services resolved within one request tree.
pub trait DependencyScope: Send + Sync {
    fn get_service(&self, service: TypeId) -> Option<AnyValue>;

    /// Release scoped instances. Called once when the root request is
    /// disposed.
    fn close(&self) {}
}

/// Creates dependency scopes.
pub trait ScopeProvider: Send + Sync {
    fn begin_scope(&self) -> Arc<dyn DependencyScope>;

    /// Resolve a service outside any scope.
    fn get_service(&self, service: TypeId) -> Option<AnyValue>;
}

type ServiceFactory = Arc<dyn Fn() -> AnyValue + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServiceLifetime {
    Singleton,
    Scoped,
}

#[derive(Clone)]
struct ServiceEntry {
    lifetime: ServiceLifetime,
    factory: ServiceFactory,
}

#[derive(Default)]
struct Services {
    entries: RwLock<HashMap<TypeId, ServiceEntry>>,
    singletons: RwLock<HashMap<TypeId, AnyValue>>,
}

impl Services {
    fn entry(&self, service: TypeId) -> Option<ServiceEntry> {
        self.entries.read().get(&service).cloned()
    }

    fn singleton(&self, service: TypeId, factory: &ServiceFactory) -> AnyValue {
        if let Some(instance) = self.singletons.read().get(&service) {
            return instance.clone();
        }
        // Built outside the lock so factories may resolve other services.
        let instance = factory();
        self.singletons
            .write()
            .entry(service)
            .or_insert(instance)
            .clone()
    }

    fn resolve_unscoped(&self, service: TypeId) -> Option<AnyValue> {
        let entry = self.entry(service)?;
        match entry.lifetime {
            ServiceLifetime::Singleton => Some(self.singleton(service, &entry.factory)),
            ServiceLifetime::Scoped => None,
        }
    }
}

/// In-process service container.
///
/// ```
/// use courier::services::ServiceRegistry;
///
/// struct Clock;
///
/// let services = ServiceRegistry::new();
/// services.add_singleton(Clock);
/// assert!(services.get::<Clock>().is_some());
/// ```
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    services: Arc<Services>,
}

impl ServiceRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a ready-made singleton.
    pub fn add_singleton<S>(&self, instance: S)
    where
        S: Send + Sync + 'static,
    {
        let instance: AnyValue = Arc::new(instance);
        self.register::<S>(ServiceLifetime::Singleton, Arc::new(move || instance.clone()));
    }

    /// Register a singleton created on first use.
    pub fn add_singleton_with<S, F>(&self, factory: F)
    where
        S: Send + Sync + 'static,
        F: Fn() -> S + Send + Sync + 'static,
    {
        self.register::<S>(
            ServiceLifetime::Singleton,
            Arc::new(move || Arc::new(factory()) as AnyValue),
        );
    }

    /// Register a service created once per dependency scope.
    pub fn add_scoped<S, F>(&self, factory: F)
    where
        S: Send + Sync + 'static,
        F: Fn() -> S + Send + Sync + 'static,
    {
        self.register::<S>(
            ServiceLifetime::Scoped,
            Arc::new(move || Arc::new(factory()) as AnyValue),
        );
    }

    /// Resolve a singleton outside any scope.
    pub fn get<S>(&self) -> Option<Arc<S>>
    where
        S: Send + Sync + 'static,
    {
        self.services
            .resolve_unscoped(TypeId::of::<S>())
            .and_then(|instance| instance.downcast::<S>().ok())
    }

    fn register<S: 'static>(&self, lifetime: ServiceLifetime, factory: ServiceFactory) {
        let service = TypeId::of::<S>();
        self.services
            .entries
            .write()
            .insert(service, ServiceEntry { lifetime, factory });
        if self.services.singletons.write().remove(&service).is_some() {
            debug!(
                service = std::any::type_name::<S>(),
                "Invalidated cached singleton"
            );
        }
    }
}

impl ScopeProvider for ServiceRegistry {
    fn begin_scope(&self) -> Arc<dyn DependencyScope> {
        Arc::new(ServiceScope {
            services: self.services.clone(),
            instances: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    fn get_service(&self, service: TypeId) -> Option<AnyValue> {
        self.services.resolve_unscoped(service)
    }
}

/// Scope created by [`ServiceRegistry`].
pub struct ServiceScope {
    services: Arc<Services>,
    instances: Mutex<HashMap<TypeId, AnyValue>>,
    closed: AtomicBool,
}

impl DependencyScope for ServiceScope {
    fn get_service(&self, service: TypeId) -> Option<AnyValue> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        let entry = self.services.entry(service)?;
        match entry.lifetime {
            ServiceLifetime::Singleton => Some(self.services.singleton(service, &entry.factory)),
            ServiceLifetime::Scoped => {
                if let Some(instance) = self.instances.lock().get(&service) {
                    return Some(instance.clone());
                }
                let instance = (entry.factory)();
                Some(
                    self.instances
                        .lock()
                        .entry(service)
                        .or_insert(instance)
                        .clone(),
                )
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.instances.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counter(usize);

    #[test]
    fn test_singleton_is_shared_across_scopes() {
        let services = ServiceRegistry::new();
        let created = Arc::new(AtomicUsize::new(0));
        let c = created.clone();
        services.add_singleton_with(move || Counter(c.fetch_add(1, Ordering::SeqCst)));

        let a = services.begin_scope().get_service(TypeId::of::<Counter>());
        let b = services.begin_scope().get_service(TypeId::of::<Counter>());

        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_scoped_instance_per_scope() {
        let services = ServiceRegistry::new();
        let created = Arc::new(AtomicUsize::new(0));
        let c = created.clone();
        services.add_scoped(move || Counter(c.fetch_add(1, Ordering::SeqCst)));

        let first = services.begin_scope();
        let a = first.get_service(TypeId::of::<Counter>()).unwrap();
        let again = first.get_service(TypeId::of::<Counter>()).unwrap();
        let other = services.begin_scope().get_service(TypeId::of::<Counter>()).unwrap();

        assert!(Arc::ptr_eq(&a, &again));
        assert!(!Arc::ptr_eq(&a, &other));
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_scoped_service_not_resolvable_without_scope() {
        let services = ServiceRegistry::new();
        services.add_scoped(|| Counter(0));
        assert!(services.get::<Counter>().is_none());
    }

    #[test]
    fn test_closed_scope_resolves_nothing() {
        let services = ServiceRegistry::new();
        services.add_scoped(|| Counter(0));
        let scope = services.begin_scope();
        scope.close();
        assert!(scope.get_service(TypeId::of::<Counter>()).is_none());
    }

    #[test]
    fn test_reregistering_invalidates_cached_singleton() {
        let services = ServiceRegistry::new();
        services.add_singleton(Counter(1));
        assert_eq!(services.get::<Counter>().unwrap().0, 1);

        services.add_singleton(Counter(2));
        assert_eq!(services.get::<Counter>().unwrap().0, 2);
    }
}
