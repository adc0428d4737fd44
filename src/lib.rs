//! Broker-agnostic integration event bus.
//!
//! Services publish [`IntegrationEvent`]s and subscribe handlers to them
//! without knowing which broker carries the messages:
//!
//! - [`SubscriptionRegistry`] maps derived event names to event types and
//!   their handler types.
//! - [`ResilientConnection`] keeps one broker connection alive with bounded
//!   exponential backoff.
//! - [`EventBus`] publishes, declares broker topology and runs the consume
//!   loop that dispatches deliveries to handlers.
//!
//! Two broker backends share the engine: an exchange/queue broker
//! ([`TopicQueueBroker`]) and a managed topic/subscription service
//! ([`ManagedBroker`]). [`EventBusFactory`] picks one from [`EventConfig`].
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use serde::{Deserialize, Serialize};
//! use integration_bus::broker::memory::InMemoryTopicBroker;
//! use integration_bus::{
//!     EventBusFactory, EventConfig, EventHeader, HandlerError, HandlerProvider,
//!     IntegrationEvent, IntegrationEventHandler, Transports,
//! };
//!
//! #[derive(Serialize, Deserialize, IntegrationEvent)]
//! struct OrderStartedIntegrationEvent {
//!     header: EventHeader,
//!     order_id: u64,
//! }
//!
//! struct OrderStartedHandler;
//!
//! impl IntegrationEventHandler<OrderStartedIntegrationEvent> for OrderStartedHandler {
//!     fn handle(&self, event: &OrderStartedIntegrationEvent) -> Result<(), HandlerError> {
//!         println!("order {} started", event.order_id);
//!         Ok(())
//!     }
//! }
//!
//! let config = EventConfig::default()
//!     .with_client_app_name("PaymentService")
//!     .with_retry_base_delay(std::time::Duration::from_millis(10));
//! let resolver = HandlerProvider::new().transient(|| OrderStartedHandler);
//! let bus = EventBusFactory::create(
//!     config,
//!     Arc::new(resolver),
//!     Transports::new().with_topic_queue(Arc::new(InMemoryTopicBroker::new())),
//! )
//! .unwrap();
//!
//! bus.subscribe::<OrderStartedIntegrationEvent, OrderStartedHandler>().unwrap();
//! bus.publish(&OrderStartedIntegrationEvent { header: EventHeader::new(), order_id: 1 })
//!     .unwrap();
//! bus.dispose();
//! ```

// Lets the derive macro's `integration_bus::` paths resolve inside this crate.
extern crate self as integration_bus;

pub mod broker;
pub mod bus;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod handler;
pub mod registry;
pub mod retry;

pub use broker::{BrokerAdapter, BrokerConsumer, Delivery, ManagedBroker, Message, TopicQueueBroker};
pub use bus::{ConsumerStats, EventBus, EventBusFactory, Transports};
pub use config::{BrokerKind, EventConfig, Serializer};
pub use connection::{
    BrokerConnection, ConnectionEvent, ConnectionSettings, ConnectionState, Connector,
    ResilientConnection,
};
pub use error::{BrokerError, BusError, CodecError, RegistryError};
pub use event::{EventHeader, IntegrationEvent};
pub use handler::{HandlerError, HandlerProvider, HandlerResolver, IntegrationEventHandler};
pub use registry::{EventType, SubscriptionInfo, SubscriptionRegistry, TypeKey};
pub use retry::RetryPolicy;
