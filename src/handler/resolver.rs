//! Handler resolution.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::registry::TypeKey;

/// A resolved handler instance, type-erased.
pub type SharedHandler = Arc<dyn Any + Send + Sync>;

/// Produces handler instances for handler type keys.
///
/// This is the seam to the consuming service's object container. It is
/// called once per handler per delivery; returning a fresh instance each
/// time or a shared one is the resolver's choice.
pub trait HandlerResolver: Send + Sync {
    fn resolve(&self, handler: &TypeKey) -> Option<SharedHandler>;
}

impl<F> HandlerResolver for F
where
    F: Fn(&TypeKey) -> Option<SharedHandler> + Send + Sync,
{
    fn resolve(&self, handler: &TypeKey) -> Option<SharedHandler> {
        self(handler)
    }
}

enum Registration {
    Transient(Box<dyn Fn() -> SharedHandler + Send + Sync>),
    Singleton(SharedHandler),
}

/// Minimal resolver: a map from handler type to a factory or a shared
/// instance.
///
/// ## Example
///
/// ```ignore
/// let provider = HandlerProvider::new()
///     .transient(|| OrderCreatedHandler::default())
///     .singleton(Arc::new(AuditHandler::new()));
/// ```
#[derive(Default)]
pub struct HandlerProvider {
    registrations: HashMap<TypeKey, Registration>,
}

impl HandlerProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a new `H` for every resolution.
    pub fn transient<H, F>(mut self, factory: F) -> Self
    where
        H: Send + Sync + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.registrations.insert(
            TypeKey::of::<H>(),
            Registration::Transient(Box::new(move || Arc::new(factory()) as SharedHandler)),
        );
        self
    }

    /// Hand out the same `H` for every resolution.
    pub fn singleton<H>(mut self, handler: Arc<H>) -> Self
    where
        H: Send + Sync + 'static,
    {
        self.registrations
            .insert(TypeKey::of::<H>(), Registration::Singleton(handler));
        self
    }

    pub fn contains<H: 'static>(&self) -> bool {
        self.registrations.contains_key(&TypeKey::of::<H>())
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}

impl HandlerResolver for HandlerProvider {
    fn resolve(&self, handler: &TypeKey) -> Option<SharedHandler> {
        match self.registrations.get(handler)? {
            Registration::Transient(factory) => Some(factory()),
            Registration::Singleton(instance) => Some(Arc::clone(instance)),
        }
    }
}
