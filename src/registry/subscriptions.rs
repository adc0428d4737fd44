use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use crate::config::EventConfig;
use crate::error::RegistryError;
use crate::event::naming::EventNaming;
use crate::event::IntegrationEvent;
use crate::handler::IntegrationEventHandler;

use super::{EventType, SubscriptionInfo, TypeKey};

type RemovalListener = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct RegistryState {
    event_types: HashMap<String, EventType>,
    handlers: HashMap<String, Vec<SubscriptionInfo>>,
}

/// In-memory subscription registry.
///
/// Thread-safe: registration, removal and the lookups the consume loop
/// performs all go through one `RwLock`, so a reader never sees an event
/// name without its type or vice versa.
///
/// ## Example
///
/// ```ignore
/// let registry = SubscriptionRegistry::new(EventNaming::new("", "IntegrationEvent"));
/// registry.on_event_removed(|name| println!("unbind {name}"));
///
/// registry.add_subscription::<OrderCreatedIntegrationEvent, OrderCreatedHandler>()?;
/// assert_eq!(registry.event_key::<OrderCreatedIntegrationEvent>(), "OrderCreated");
///
/// registry.remove_subscription::<OrderCreatedIntegrationEvent, OrderCreatedHandler>();
/// assert!(registry.is_empty());
/// ```
pub struct SubscriptionRegistry {
    naming: EventNaming,
    state: RwLock<RegistryState>,
    removal_listeners: RwLock<Vec<RemovalListener>>,
}

impl SubscriptionRegistry {
    pub fn new(naming: EventNaming) -> Self {
        Self {
            naming,
            state: RwLock::new(RegistryState::default()),
            removal_listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn from_config(config: &EventConfig) -> Self {
        Self::new(EventNaming::from_config(config))
    }

    pub fn naming(&self) -> &EventNaming {
        &self.naming
    }

    /// True iff no event name is registered.
    pub fn is_empty(&self) -> bool {
        self.read().handlers.is_empty()
    }

    /// Wire name of `E`.
    pub fn event_key<E: IntegrationEvent>(&self) -> String {
        self.naming.key::<E>()
    }

    /// Register `H` as a handler of `E`.
    ///
    /// Returns `true` when this is the first handler for the event name,
    /// i.e. when broker-side topology has to be declared.
    pub fn add_subscription<E, H>(&self) -> Result<bool, RegistryError>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        self.add(EventType::of::<E>(), SubscriptionInfo::of::<E, H>())
    }

    /// Tag-based form of [`add_subscription`](Self::add_subscription).
    pub fn add(&self, event_type: EventType, info: SubscriptionInfo) -> Result<bool, RegistryError> {
        let event_name = self.naming.name_of(event_type.type_name());
        let mut state = self.write();

        let first = match state.event_types.get(&event_name) {
            Some(existing) if *existing != event_type => {
                return Err(RegistryError::EventNameCollision {
                    event_name,
                    existing: existing.key().name(),
                    requested: event_type.key().name(),
                });
            }
            Some(_) => false,
            None => true,
        };

        let handlers = state.handlers.entry(event_name.clone()).or_default();
        if handlers
            .iter()
            .any(|s| s.handler_type() == info.handler_type())
        {
            return Err(RegistryError::HandlerAlreadyRegistered {
                event_name,
                handler: info.handler_type().name(),
            });
        }
        handlers.push(info);

        if first {
            state.event_types.insert(event_name.clone(), event_type);
        }
        debug!(event_name = %event_name, handler = %info.handler_type(), first, "subscription added");
        Ok(first)
    }

    /// Remove `H` from the handlers of `E`. Unknown pairs are ignored.
    ///
    /// Returns whether anything was removed. When the last handler of an
    /// event goes, the event name is unmapped and removal listeners fire.
    pub fn remove_subscription<E, H>(&self) -> bool
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        self.remove(EventType::of::<E>(), TypeKey::of::<H>())
    }

    /// Tag-based form of [`remove_subscription`](Self::remove_subscription).
    pub fn remove(&self, event_type: EventType, handler: TypeKey) -> bool {
        let event_name = self.naming.name_of(event_type.type_name());

        let emptied = {
            let mut state = self.write();
            if state.event_types.get(&event_name) != Some(&event_type) {
                return false;
            }
            let Some(handlers) = state.handlers.get_mut(&event_name) else {
                return false;
            };
            let before = handlers.len();
            handlers.retain(|s| s.handler_type() != handler);
            if handlers.len() == before {
                return false;
            }
            if handlers.is_empty() {
                state.handlers.remove(&event_name);
                state.event_types.remove(&event_name);
                true
            } else {
                false
            }
        };

        debug!(event_name = %event_name, handler = %handler, emptied, "subscription removed");
        if emptied {
            self.raise_event_removed(&event_name);
        }
        true
    }

    pub fn has_subscriptions_for<E: IntegrationEvent>(&self) -> bool {
        self.has_subscriptions_for_event(&self.event_key::<E>())
    }

    pub fn has_subscriptions_for_event(&self, event_name: &str) -> bool {
        self.read().handlers.contains_key(event_name)
    }

    pub fn event_type_by_name(&self, event_name: &str) -> Result<EventType, RegistryError> {
        self.read()
            .event_types
            .get(event_name)
            .copied()
            .ok_or_else(|| RegistryError::UnknownEvent(event_name.to_string()))
    }

    /// Handlers of `E` in registration order; empty when none.
    pub fn handlers_for<E: IntegrationEvent>(&self) -> Vec<SubscriptionInfo> {
        self.handlers_for_event(&self.event_key::<E>())
    }

    pub fn handlers_for_event(&self, event_name: &str) -> Vec<SubscriptionInfo> {
        self.read()
            .handlers
            .get(event_name)
            .cloned()
            .unwrap_or_default()
    }

    /// Event type and handlers for `event_name`, read under one lock.
    pub fn lookup(&self, event_name: &str) -> Option<(EventType, Vec<SubscriptionInfo>)> {
        let state = self.read();
        let event_type = *state.event_types.get(event_name)?;
        let handlers = state.handlers.get(event_name).cloned().unwrap_or_default();
        Some((event_type, handlers))
    }

    /// Registered event names, sorted.
    pub fn event_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Drop every mapping without notifying removal listeners.
    pub fn clear(&self) {
        let mut state = self.write();
        state.event_types.clear();
        state.handlers.clear();
    }

    /// Call `listener` with the event name whenever an event loses its
    /// last handler.
    pub fn on_event_removed<F>(&self, listener: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.removal_listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(listener));
    }

    fn raise_event_removed(&self, event_name: &str) {
        let listeners: Vec<RemovalListener> = self
            .removal_listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener(event_name);
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}
