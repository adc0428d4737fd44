//! Integration events.
//!
//! An integration event is a fact one service tells others about. Every
//! event carries an [`EventHeader`] (identity and creation time) and is
//! addressed on the broker by a name derived from its type name, see
//! [`naming`].

pub mod codec;
pub mod naming;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use integration_bus_macros::IntegrationEvent;

/// Identity shared by all integration events, generated at construction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHeader {
    pub id: Uuid,
    pub creation_date: DateTime<Utc>,
}

impl EventHeader {
    /// Fresh header: random id, current time.
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            creation_date: Utc::now(),
        }
    }
}

impl Default for EventHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// An event that can travel over the bus.
///
/// Usually derived:
///
/// ```
/// use integration_bus::{EventHeader, IntegrationEvent};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Serialize, Deserialize, IntegrationEvent)]
/// pub struct OrderCreatedIntegrationEvent {
///     pub header: EventHeader,
///     pub order_id: u64,
/// }
///
/// let event = OrderCreatedIntegrationEvent { header: EventHeader::new(), order_id: 1 };
/// assert_eq!(OrderCreatedIntegrationEvent::TYPE_NAME, "OrderCreatedIntegrationEvent");
/// assert_eq!(event.id(), event.header.id);
/// ```
pub trait IntegrationEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Type name the wire name is derived from.
    const TYPE_NAME: &'static str;

    fn header(&self) -> &EventHeader;

    fn id(&self) -> Uuid {
        self.header().id
    }

    fn creation_date(&self) -> DateTime<Utc> {
        self.header().creation_date
    }
}
