//! Handler activation.
//!
//! [`CachingActivator`] compiles one activation function per descriptor,
//! shaped by the descriptor's lifetime. The most recently used function sits
//! in a single lock-free slot; misses fall back to a shared concurrent map.
//! Racing first uses of the same descriptor compile it at most once, while
//! racing writers to the slot are harmless because every compiled function
//! for a descriptor is equivalent.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use tracing::debug;

use crate::descriptor::{DescriptorId, HandlerDescriptor, HandlerInstance, HandlerLifetime};
use crate::error::DispatchError;
use crate::request::Request;
use crate::task::{guard_result, Fault};

/// Creates handler instances.
pub trait HandlerActivator: Send + Sync {
    fn create(
        &self,
        request: &Arc<Request>,
        descriptor: &Arc<HandlerDescriptor>,
    ) -> Result<HandlerInstance, DispatchError>;
}

impl<T: HandlerActivator + ?Sized> HandlerActivator for Arc<T> {
    fn create(
        &self,
        request: &Arc<Request>,
        descriptor: &Arc<HandlerDescriptor>,
    ) -> Result<HandlerInstance, DispatchError> {
        (**self).create(request, descriptor)
    }
}

type ActivateFn = Arc<dyn Fn(&Arc<Request>) -> Result<HandlerInstance, Fault> + Send + Sync>;

struct CachedActivator {
    descriptor: DescriptorId,
    activate: ActivateFn,
}

/// Activator with a single-slot fast path and a per-descriptor memo.
#[derive(Default)]
pub struct CachingActivator {
    last: ArcSwapOption<CachedActivator>,
    activators: DashMap<DescriptorId, ActivateFn>,
    compiled: AtomicUsize,
}

impl CachingActivator {
    /// An activator with empty caches.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of activation functions compiled so far.
    pub fn compiled_count(&self) -> usize {
        self.compiled.load(Ordering::SeqCst)
    }

    fn activator_for(&self, descriptor: &Arc<HandlerDescriptor>) -> ActivateFn {
        let current = self.last.load();
        if let Some(cached) = &*current {
            if cached.descriptor == descriptor.id() {
                return cached.activate.clone();
            }
        }

        let activate = self
            .activators
            .entry(descriptor.id())
            .or_insert_with(|| {
                self.compiled.fetch_add(1, Ordering::SeqCst);
                debug!(
                    id = %descriptor.id(),
                    handler = descriptor.handler_name(),
                    lifetime = ?descriptor.lifetime(),
                    "Compiled handler activator"
                );
                compile(descriptor)
            })
            .clone();

        // Losing this race only means another descriptor keeps the slot.
        let _ = self.last.compare_and_swap(
            &current,
            Some(Arc::new(CachedActivator {
                descriptor: descriptor.id(),
                activate: activate.clone(),
            })),
        );
        activate
    }
}

fn compile(descriptor: &Arc<HandlerDescriptor>) -> ActivateFn {
    let descriptor = descriptor.clone();
    match descriptor.lifetime() {
        HandlerLifetime::Transient => Arc::new(move |request: &Arc<Request>| {
            descriptor.create_instance(request)
        }),
        HandlerLifetime::Singleton => Arc::new(move |request: &Arc<Request>| {
            let slot = descriptor.singleton_slot();
            if let Some(instance) = slot.get() {
                return Ok(instance.clone());
            }
            let instance = descriptor.create_instance(request)?;
            Ok(slot.get_or_init(|| instance).clone())
        }),
        HandlerLifetime::Scoped => Arc::new(move |request: &Arc<Request>| {
            request.scoped_handler(descriptor.id(), || descriptor.create_instance(request))
        }),
    }
}

impl HandlerActivator for CachingActivator {
    fn create(
        &self,
        request: &Arc<Request>,
        descriptor: &Arc<HandlerDescriptor>,
    ) -> Result<HandlerInstance, DispatchError> {
        let activate = self.activator_for(descriptor);
        guard_result(|| activate(request)).map_err(|cause| DispatchError::Activation {
            handler: descriptor.handler_name(),
            cause,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::CommandHandler;
    use crate::registry::{HandlerRegistry, Registration};
    use crate::request::Envelope;
    use crate::task::Task;
    use std::thread;

    struct Ping;

    struct PingHandler;

    impl CommandHandler for PingHandler {
        type Command = Ping;
        type Output = ();

        fn handle(&self, _command: &Ping, _request: &Arc<Request>) -> Task<()> {
            Task::completed()
        }
    }

    fn descriptor(lifetime: HandlerLifetime) -> Arc<HandlerDescriptor> {
        let mut registry = HandlerRegistry::new(HandlerLifetime::Transient);
        registry.register(Registration::command(|_| Ok(PingHandler)).lifetime(lifetime))
    }

    fn request() -> Arc<Request> {
        Request::new(Envelope::command::<_, ()>(Ping))
    }

    #[test]
    fn test_transient_creates_new_instance_each_time() {
        let activator = CachingActivator::new();
        let descriptor = descriptor(HandlerLifetime::Transient);
        let request = request();

        let a = activator.create(&request, &descriptor).unwrap();
        let b = activator.create(&request, &descriptor).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(activator.compiled_count(), 1);
    }

    #[test]
    fn test_singleton_shared_across_requests() {
        let activator = CachingActivator::new();
        let descriptor = descriptor(HandlerLifetime::Singleton);

        let a = activator.create(&request(), &descriptor).unwrap();
        let b = activator.create(&request(), &descriptor).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_scoped_shared_within_tree_only() {
        let activator = CachingActivator::new();
        let descriptor = descriptor(HandlerLifetime::Scoped);
        let root = request();
        let child = root.child(Envelope::command::<_, ()>(Ping));

        let a = activator.create(&root, &descriptor).unwrap();
        let b = activator.create(&child, &descriptor).unwrap();
        let other = activator.create(&request(), &descriptor).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &other));
    }

    #[test]
    fn test_alternating_descriptors_compile_once_each() {
        let activator = CachingActivator::new();
        let first = descriptor(HandlerLifetime::Transient);
        let second = descriptor(HandlerLifetime::Transient);
        let request = request();

        for _ in 0..3 {
            activator.create(&request, &first).unwrap();
            activator.create(&request, &second).unwrap();
        }
        assert_eq!(activator.compiled_count(), 2);
    }

    #[test]
    fn test_concurrent_first_use_compiles_once() {
        let activator = Arc::new(CachingActivator::new());
        let descriptor = descriptor(HandlerLifetime::Transient);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let activator = activator.clone();
                let descriptor = descriptor.clone();
                thread::spawn(move || {
                    activator.create(&request(), &descriptor).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(activator.compiled_count(), 1);
    }

    #[test]
    fn test_factory_error_wrapped_in_activation_fault() {
        let mut registry = HandlerRegistry::new(HandlerLifetime::Transient);
        let descriptor = registry.register(Registration::command(|_| -> Result<PingHandler, Fault> {
            Err(DispatchError::Config("missing connection".to_string()).into())
        }));

        let err = CachingActivator::new()
            .create(&request(), &descriptor)
            .unwrap_err();
        match err {
            DispatchError::Activation { handler, cause } => {
                assert_eq!(handler, std::any::type_name::<PingHandler>());
                assert!(cause.is::<DispatchError>());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_factory_panic_wrapped_in_activation_fault() {
        let mut registry = HandlerRegistry::new(HandlerLifetime::Transient);
        let descriptor = registry.register(Registration::command(
            |_| -> Result<PingHandler, Fault> { panic!("constructor panicked") },
        ));

        let err = CachingActivator::new()
            .create(&request(), &descriptor)
            .unwrap_err();
        assert!(matches!(err, DispatchError::Activation { .. }));
    }
}
