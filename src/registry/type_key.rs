use std::any::{type_name, Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::error::CodecError;
use crate::event::codec::decode_payload;
use crate::event::IntegrationEvent;
use crate::handler::{HandlerError, HandlerResolver, IntegrationEventHandler};

/// A decoded event whose concrete type is only known to its `EventType`.
pub type DecodedEvent = Box<dyn Any + Send + Sync>;

type DecodeFn = fn(&str, &[u8]) -> Result<DecodedEvent, CodecError>;
type InvokeFn = fn(&dyn HandlerResolver, &(dyn Any + Send + Sync)) -> Result<(), HandlerError>;

/// Stable identifier for a Rust type. Compared by `TypeId`; the name is
/// for logs and error messages.
#[derive(Clone, Copy)]
pub struct TypeKey {
    id: TypeId,
    name: &'static str,
}

impl TypeKey {
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    /// Fully qualified type name.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for TypeKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeKey {}

impl Hash for TypeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeKey({})", self.name)
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// The concrete type registered under an event name, with the means to
/// decode a payload into it.
#[derive(Clone, Copy)]
pub struct EventType {
    key: TypeKey,
    type_name: &'static str,
    decode: DecodeFn,
}

impl EventType {
    pub fn of<E: IntegrationEvent>() -> Self {
        Self {
            key: TypeKey::of::<E>(),
            type_name: E::TYPE_NAME,
            decode: decode_event::<E>,
        }
    }

    pub fn key(&self) -> TypeKey {
        self.key
    }

    /// `IntegrationEvent::TYPE_NAME` of the event.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn decode(&self, content_type: &str, payload: &[u8]) -> Result<DecodedEvent, CodecError> {
        (self.decode)(content_type, payload)
    }
}

impl PartialEq for EventType {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for EventType {}

impl fmt::Debug for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventType")
            .field("type_name", &self.type_name)
            .field("key", &self.key)
            .finish()
    }
}

fn decode_event<E: IntegrationEvent>(
    content_type: &str,
    payload: &[u8],
) -> Result<DecodedEvent, CodecError> {
    let event: E = decode_payload(content_type, payload)?;
    Ok(Box::new(event))
}

/// One handler registration for an event.
#[derive(Clone, Copy)]
pub struct SubscriptionInfo {
    handler: TypeKey,
    event: TypeKey,
    invoke: InvokeFn,
}

impl SubscriptionInfo {
    pub fn of<E, H>() -> Self
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        Self {
            handler: TypeKey::of::<H>(),
            event: TypeKey::of::<E>(),
            invoke: invoke_handler::<E, H>,
        }
    }

    pub fn handler_type(&self) -> TypeKey {
        self.handler
    }

    pub fn event_type(&self) -> TypeKey {
        self.event
    }

    /// Resolve a handler instance and run it against `event`.
    pub fn invoke(
        &self,
        resolver: &dyn HandlerResolver,
        event: &(dyn Any + Send + Sync),
    ) -> Result<(), HandlerError> {
        (self.invoke)(resolver, event)
    }
}

impl PartialEq for SubscriptionInfo {
    fn eq(&self, other: &Self) -> bool {
        self.handler == other.handler && self.event == other.event
    }
}

impl Eq for SubscriptionInfo {}

impl fmt::Debug for SubscriptionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionInfo")
            .field("handler", &self.handler)
            .field("event", &self.event)
            .finish()
    }
}

fn invoke_handler<E, H>(
    resolver: &dyn HandlerResolver,
    event: &(dyn Any + Send + Sync),
) -> Result<(), HandlerError>
where
    E: IntegrationEvent,
    H: IntegrationEventHandler<E>,
{
    let mismatch = || HandlerError::EventMismatch {
        handler: type_name::<H>(),
        event: type_name::<E>(),
    };
    let event = event.downcast_ref::<E>().ok_or_else(mismatch)?;
    let instance = resolver
        .resolve(&TypeKey::of::<H>())
        .ok_or(HandlerError::Unresolved(type_name::<H>()))?;
    let handler = instance.downcast::<H>().map_err(|_| mismatch())?;
    handler.handle(event)
}
