//! The event bus engine.
//!
//! ```text
//! publish(&E) ──► registry.event_key::<E>() ──► Serializer ──► BrokerAdapter::publish
//!                                                                   (retried)
//! subscribe::<E, H>() ──► registry ──► declare_binding ──► consume loop
//!
//! consume loop: BrokerConsumer::next ──► registry.lookup(name) ──► EventType::decode
//!               ──► HandlerResolver ──► H::handle ──► ack
//! ```

mod consumer;
mod event_bus;
mod factory;

pub use consumer::ConsumerStats;
pub use event_bus::EventBus;
pub use factory::{EventBusFactory, Transports};
