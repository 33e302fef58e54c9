//! Per-dispatch request state.
//!
//! Requests form a tree: a handler may dispatch nested messages, each with a
//! child request pointing back at its parent. State shared by the whole tree
//! (correlation id, dependency scope, scoped handler instances, disposables)
//! is owned by the root and released exactly once when the root is disposed.

use std::any::{type_name, Any, TypeId};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::descriptor::{DescriptorId, HandlerInstance, MessageKind};
use crate::services::{DependencyScope, ScopeProvider};
use crate::task::{AnyValue, CancellationToken, Fault};
use crate::validation::ValidationFailure;

/// A type-erased message plus the type information dispatch needs.
#[derive(Clone)]
pub struct Envelope {
    message: AnyValue,
    message_type: TypeId,
    message_name: &'static str,
    result_name: &'static str,
    kind: MessageKind,
}

impl Envelope {
    /// Wrap a command whose handler produces `R`.
    pub fn command<M, R>(message: M) -> Self
    where
        M: Send + Sync + 'static,
        R: 'static,
    {
        Self {
            message: Arc::new(message),
            message_type: TypeId::of::<M>(),
            message_name: type_name::<M>(),
            result_name: type_name::<R>(),
            kind: MessageKind::Command,
        }
    }

    /// Wrap an event.
    pub fn event<M>(message: M) -> Self
    where
        M: Send + Sync + 'static,
    {
        Self {
            message: Arc::new(message),
            message_type: TypeId::of::<M>(),
            message_name: type_name::<M>(),
            result_name: type_name::<()>(),
            kind: MessageKind::Event,
        }
    }

    /// Command or event.
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Type name of the message.
    pub fn message_name(&self) -> &'static str {
        self.message_name
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("kind", &self.kind)
            .field("message", &self.message_name)
            .field("result", &self.result_name)
            .finish()
    }
}

/// State shared by every request in one tree.
struct Tree {
    correlation_id: OnceLock<Uuid>,
    scope_provider: Option<Arc<dyn ScopeProvider>>,
    scope: Mutex<Option<Arc<dyn DependencyScope>>>,
    scoped_handlers: DashMap<DescriptorId, HandlerInstance>,
    disposables: Mutex<Vec<Box<dyn Any + Send>>>,
    disposed: AtomicBool,
}

/// One dispatch call.
pub struct Request {
    envelope: Envelope,
    parent: Option<Weak<Request>>,
    tree: Arc<Tree>,
    cancellation: CancellationToken,
    validation: Mutex<Vec<ValidationFailure>>,
}

impl Request {
    /// A root request with no dependency scope.
    pub fn new(envelope: Envelope) -> Arc<Self> {
        Self::with_options(envelope, None, CancellationToken::none())
    }

    /// A root request.
    pub fn with_options(
        envelope: Envelope,
        scope_provider: Option<Arc<dyn ScopeProvider>>,
        cancellation: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            envelope,
            parent: None,
            tree: Arc::new(Tree {
                correlation_id: OnceLock::new(),
                scope_provider,
                scope: Mutex::new(None),
                scoped_handlers: DashMap::new(),
                disposables: Mutex::new(Vec::new()),
                disposed: AtomicBool::new(false),
            }),
            cancellation,
            validation: Mutex::new(Vec::new()),
        })
    }

    /// A nested request sharing this request's tree.
    pub fn child(self: &Arc<Self>, envelope: Envelope) -> Arc<Self> {
        Arc::new(Self {
            envelope,
            parent: Some(Arc::downgrade(self)),
            tree: self.tree.clone(),
            cancellation: self.cancellation.clone(),
            validation: Mutex::new(Vec::new()),
        })
    }

    /// Borrow the message as `M`.
    pub fn message<M: 'static>(&self) -> Option<&M> {
        self.envelope.message.downcast_ref::<M>()
    }

    /// The type-erased message.
    pub fn message_value(&self) -> &AnyValue {
        &self.envelope.message
    }

    /// `TypeId` of the message.
    pub fn message_type(&self) -> TypeId {
        self.envelope.message_type
    }

    /// Type name of the message.
    pub fn message_name(&self) -> &'static str {
        self.envelope.message_name
    }

    /// Type name of the expected result.
    pub fn result_name(&self) -> &'static str {
        self.envelope.result_name
    }

    /// Command or event.
    pub fn kind(&self) -> MessageKind {
        self.envelope.kind
    }

    /// The parent request, if this is a nested dispatch still in flight.
    pub fn parent(&self) -> Option<Arc<Request>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// Returns true for the request that owns the tree.
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Correlation id shared by the whole tree, created on first use.
    pub fn correlation_id(&self) -> Uuid {
        *self.tree.correlation_id.get_or_init(Uuid::new_v4)
    }

    /// Token checked before activation and between continuations.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// The tree's dependency scope, created on first use.
    ///
    /// Returns `None` when no provider was configured or the tree has been
    /// disposed.
    pub fn scope(&self) -> Option<Arc<dyn DependencyScope>> {
        let provider = self.tree.scope_provider.as_ref()?;
        if self.tree.disposed.load(Ordering::Acquire) {
            return None;
        }
        let mut scope = self.tree.scope.lock();
        if scope.is_none() {
            *scope = Some(provider.begin_scope());
        }
        scope.clone()
    }

    /// Resolve a service through the tree's dependency scope.
    pub fn get_service<S>(&self) -> Option<Arc<S>>
    where
        S: Send + Sync + 'static,
    {
        self.scope()?
            .get_service(TypeId::of::<S>())
            .and_then(|service| service.downcast::<S>().ok())
    }

    /// Keep `resource` alive until the root request is disposed.
    ///
    /// Resources are dropped in reverse registration order. Registering on a
    /// disposed tree drops the resource immediately.
    pub fn register_for_dispose<D>(&self, resource: D)
    where
        D: Send + 'static,
    {
        let mut disposables = self.tree.disposables.lock();
        if self.tree.disposed.load(Ordering::Acquire) {
            drop(disposables);
            drop(resource);
            return;
        }
        disposables.push(Box::new(resource));
    }

    /// Record a validation failure for this message.
    pub fn add_validation_failure(&self, failure: ValidationFailure) {
        self.validation.lock().push(failure);
    }

    /// Validation failures recorded so far.
    pub fn validation_failures(&self) -> Vec<ValidationFailure> {
        self.validation.lock().clone()
    }

    /// Returns true if no validation failure was recorded.
    pub fn is_valid(&self) -> bool {
        self.validation.lock().is_empty()
    }

    /// Handler instance shared by every request in the tree.
    pub(crate) fn scoped_handler<F>(
        &self,
        descriptor: DescriptorId,
        create: F,
    ) -> Result<HandlerInstance, Fault>
    where
        F: FnOnce() -> Result<HandlerInstance, Fault>,
    {
        if let Some(instance) = self.tree.scoped_handlers.get(&descriptor) {
            return Ok(instance.clone());
        }
        let instance = create()?;
        Ok(self
            .tree
            .scoped_handlers
            .entry(descriptor)
            .or_insert(instance)
            .clone())
    }

    /// Release the tree's scope and disposables.
    ///
    /// Only the root owns the tree; disposing a child is a no-op. Runs at
    /// most once.
    pub fn dispose(&self) {
        if !self.is_root() {
            return;
        }
        // The flag flips under the disposables lock so a racing
        // registration either lands in this batch or is dropped by its caller.
        let mut disposables = {
            let mut guard = self.tree.disposables.lock();
            if self.tree.disposed.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *guard)
        };

        if let Some(scope) = self.tree.scope.lock().take() {
            scope.close();
        }
        self.tree.scoped_handlers.clear();

        let count = disposables.len();
        while let Some(resource) = disposables.pop() {
            drop(resource);
        }

        debug!(
            message = self.message_name(),
            disposables = count,
            "Disposed request tree"
        );
    }

    /// Returns true once the root was disposed.
    pub fn is_disposed(&self) -> bool {
        self.tree.disposed.load(Ordering::Acquire)
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("kind", &self.kind())
            .field("message", &self.message_name())
            .field("root", &self.is_root())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ServiceRegistry;
    use std::sync::atomic::AtomicUsize;

    struct Ping;

    struct Tracked {
        label: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.log.lock().push(self.label);
        }
    }

    #[test]
    fn test_message_downcast() {
        let request = Request::new(Envelope::command::<_, u32>(7u64));
        assert_eq!(request.message::<u64>(), Some(&7));
        assert!(request.message::<u32>().is_none());
        assert_eq!(request.result_name(), "u32");
        assert_eq!(request.kind(), MessageKind::Command);
    }

    #[test]
    fn test_child_shares_correlation_id_and_links_parent() {
        let root = Request::new(Envelope::command::<_, ()>(Ping));
        let child = root.child(Envelope::event(Ping));

        assert!(root.is_root());
        assert!(!child.is_root());
        assert_eq!(root.correlation_id(), child.correlation_id());
        assert!(Arc::ptr_eq(&child.parent().unwrap(), &root));
    }

    #[test]
    fn test_child_does_not_keep_parent_alive() {
        let root = Request::new(Envelope::command::<_, ()>(Ping));
        let child = root.child(Envelope::event(Ping));
        drop(root);
        assert!(child.parent().is_none());
        assert!(child.is_disposed());
    }

    #[test]
    fn test_scope_created_once_per_tree() {
        let services = ServiceRegistry::new();
        let provider: Arc<dyn ScopeProvider> = Arc::new(services.clone());
        let root = Request::with_options(
            Envelope::command::<_, ()>(Ping),
            Some(provider),
            CancellationToken::none(),
        );
        let child = root.child(Envelope::event(Ping));

        let a = root.scope().unwrap();
        let b = child.scope().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_scoped_service_released_on_dispose() {
        let services = ServiceRegistry::new();
        let created = Arc::new(AtomicUsize::new(0));
        let c = created.clone();
        services.add_scoped(move || c.fetch_add(1, Ordering::SeqCst));

        let root = Request::with_options(
            Envelope::command::<_, ()>(Ping),
            Some(Arc::new(services)),
            CancellationToken::none(),
        );
        assert!(root.get_service::<usize>().is_some());
        root.dispose();
        assert!(root.scope().is_none());
        assert!(root.get_service::<usize>().is_none());
    }

    #[test]
    fn test_disposables_released_once_in_reverse_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let root = Request::new(Envelope::command::<_, ()>(Ping));
        let child = root.child(Envelope::event(Ping));

        root.register_for_dispose(Tracked {
            label: "first",
            log: log.clone(),
        });
        child.register_for_dispose(Tracked {
            label: "second",
            log: log.clone(),
        });

        child.dispose();
        assert!(log.lock().is_empty());

        root.dispose();
        root.dispose();
        assert_eq!(*log.lock(), vec!["second", "first"]);
    }

    #[test]
    fn test_register_after_dispose_drops_immediately() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let root = Request::new(Envelope::command::<_, ()>(Ping));
        root.dispose();
        root.register_for_dispose(Tracked {
            label: "late",
            log: log.clone(),
        });
        assert_eq!(*log.lock(), vec!["late"]);
    }

    #[test]
    fn test_dropping_root_disposes_tree() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let root = Request::new(Envelope::command::<_, ()>(Ping));
        root.register_for_dispose(Tracked {
            label: "dropped",
            log: log.clone(),
        });
        drop(root);
        assert_eq!(*log.lock(), vec!["dropped"]);
    }

    #[test]
    fn test_registration_racing_dispose_is_released_by_dispose_or_caller() {
        struct Counted(Arc<AtomicUsize>);

        impl Drop for Counted {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(AtomicUsize::new(0));
        for _ in 0..200 {
            let root = Request::new(Envelope::command::<_, ()>(Ping));
            let before = dropped.load(Ordering::SeqCst);

            let registrars: Vec<_> = (0..4)
                .map(|_| {
                    let child = root.child(Envelope::event(Ping));
                    let dropped = dropped.clone();
                    std::thread::spawn(move || {
                        for _ in 0..25 {
                            child.register_for_dispose(Counted(dropped.clone()));
                        }
                    })
                })
                .collect();
            root.dispose();
            for registrar in registrars {
                registrar.join().unwrap();
            }

            // The root is still alive, so nothing may be parked on the tree.
            assert_eq!(dropped.load(Ordering::SeqCst) - before, 100);
        }
    }
}
