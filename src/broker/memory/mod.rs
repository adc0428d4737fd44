//! In-process brokers for tests and single-process deployments.
//!
//! [`InMemoryTopicBroker`] behaves like an exchange/queue broker and
//! [`InMemoryServiceBus`] like a managed topic/subscription service. Both
//! keep unacknowledged deliveries until settled, redeliver what a dropped
//! channel left behind, and expose [`BrokerControls`] for injecting
//! connection, publish and ack failures.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use integration_bus::broker::memory::InMemoryTopicBroker;
//! use integration_bus::{EventBusFactory, EventConfig, HandlerProvider, Transports};
//!
//! let broker = InMemoryTopicBroker::new();
//! let bus = EventBusFactory::create(
//!     EventConfig::default().with_client_app_name("Billing"),
//!     Arc::new(HandlerProvider::new()),
//!     Transports::new().with_topic_queue(Arc::new(broker.clone())),
//! )
//! .unwrap();
//! assert!(!bus.is_connected());
//! ```

mod amqp;
mod shared;
mod service_bus;

pub use self::amqp::InMemoryTopicBroker;
pub use self::shared::BrokerControls;
pub use self::service_bus::{entity_path, InMemoryServiceBus};
