//! Handlers for inbound integration events.
//!
//! A handler type implements [`IntegrationEventHandler<E>`] for the event
//! it reacts to. The bus never holds handler instances itself: for every
//! delivery it asks a [`HandlerResolver`] for one, so the consuming
//! service decides whether handlers are per-message or shared.

mod resolver;

use std::error::Error as StdError;

use thiserror::Error;

use crate::error::BusError;
use crate::event::IntegrationEvent;

pub use resolver::{HandlerProvider, HandlerResolver, SharedHandler};

/// Reacts to one event type.
///
/// ## Example
///
/// ```ignore
/// struct OrderStartedHandler { bus: Weak<EventBus> }
///
/// impl IntegrationEventHandler<OrderStartedIntegrationEvent> for OrderStartedHandler {
///     fn handle(&self, event: &OrderStartedIntegrationEvent) -> Result<(), HandlerError> {
///         let bus = self.bus.upgrade().ok_or(HandlerError::Rejected("bus gone".into()))?;
///         bus.publish(&OrderPaymentSuccessIntegrationEvent::new(event.order_id))?;
///         Ok(())
///     }
/// }
/// ```
pub trait IntegrationEventHandler<E: IntegrationEvent>: Send + Sync + 'static {
    fn handle(&self, event: &E) -> Result<(), HandlerError>;
}

/// Error type for handler invocations.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The resolver had no instance for this handler type.
    #[error("no instance resolvable for handler `{0}`")]
    Unresolved(&'static str),
    /// The resolved instance or decoded event had an unexpected type.
    #[error("handler `{handler}` cannot handle `{event}`")]
    EventMismatch {
        handler: &'static str,
        event: &'static str,
    },
    /// Business logic rejected the event.
    #[error("rejected: {0}")]
    Rejected(String),
    /// The handler panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),
    /// A follow-up publish from inside the handler failed.
    #[error("publish from handler failed: {0}")]
    Publish(#[source] Box<BusError>),
    #[error("handler error: {0}")]
    Other(Box<dyn StdError + Send + Sync>),
}

impl From<BusError> for HandlerError {
    fn from(err: BusError) -> Self {
        HandlerError::Publish(Box::new(err))
    }
}

impl HandlerError {
    pub fn other(err: impl StdError + Send + Sync + 'static) -> Self {
        HandlerError::Other(Box::new(err))
    }
}
