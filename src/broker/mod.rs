//! Broker adapters.
//!
//! The engine talks to a broker through [`BrokerAdapter`] (publish and
//! topology) and [`BrokerConsumer`] (the receiving side). Two adapters
//! exist, differing only in how topology is declared:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     EventBus (engine)                         │
//! │  publish() / subscribe() / unsubscribe() / consume loop       │
//! └──────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │             BrokerAdapter + BrokerConsumer                    │
//! └──────────────────────────────────────────────────────────────┘
//!            │                                  │
//!            ▼                                  ▼
//! ┌────────────────────────┐       ┌──────────────────────────────┐
//! │ TopicQueueBroker       │       │ ManagedBroker                │
//! │ exchange → queue/event │       │ topic → subscription/event   │
//! │ (AmqpChannel)          │       │ (ServiceBusSession)          │
//! └────────────────────────┘       └──────────────────────────────┘
//! ```
//!
//! Each adapter reaches its broker through a [`ResilientConnection`]
//! over a pluggable [`Connector`]; in-memory brokers for both are in
//! [`memory`].
//!
//! [`ResilientConnection`]: crate::connection::ResilientConnection
//! [`Connector`]: crate::connection::Connector

pub mod managed;
#[cfg(feature = "memory")]
pub mod memory;
pub mod topic_queue;

use std::time::Duration;

use crate::config::BrokerKind;
use crate::connection::ConnectionState;
use crate::error::BusError;

pub use managed::{ManagedBroker, ServiceBusConnection, ServiceBusSession};
pub use topic_queue::{AmqpChannel, AmqpConnection, TopicQueueBroker};

/// A message as it travels over the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// Unique message id (the event id).
    pub id: String,
    /// Routing key / label: the event's wire name.
    pub event_name: String,
    pub content_type: String,
    /// Serialized event.
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(
        id: impl Into<String>,
        event_name: impl Into<String>,
        content_type: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            id: id.into(),
            event_name: event_name.into(),
            content_type: content_type.into(),
            payload,
        }
    }
}

/// A received message awaiting settlement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub message: Message,
    /// Delivery tag (topic/queue broker) or lock token (managed broker).
    pub tag: u64,
    /// Set when the broker has delivered this message before.
    pub redelivered: bool,
}

/// Publish and topology operations of one broker backend.
pub trait BrokerAdapter: Send + Sync {
    fn kind(&self) -> BrokerKind;

    fn connection_state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool;

    fn try_connect(&self) -> Result<bool, BusError>;

    /// Declare the destination topology and send one message. Connects
    /// first if needed; does not retry.
    fn publish(&self, message: &Message) -> Result<(), BusError>;

    /// Declare the queue/subscription for `event_name` and bind it.
    /// Idempotent.
    fn declare_binding(&self, event_name: &str) -> Result<(), BusError>;

    fn remove_binding(&self, event_name: &str) -> Result<(), BusError>;

    /// Open a receiving session on its own channel.
    fn open_consumer(&self) -> Result<Box<dyn BrokerConsumer>, BusError>;

    fn dispose(&self);
}

/// Receiving side of a broker adapter. Owned by the consume loop.
pub trait BrokerConsumer: Send {
    /// Start receiving messages for `event_name`.
    fn listen(&mut self, event_name: &str) -> Result<(), BusError>;

    fn unlisten(&mut self, event_name: &str) -> Result<(), BusError>;

    /// Wait up to `timeout` for the next message.
    fn next(&mut self, timeout: Duration) -> Result<Option<Delivery>, BusError>;

    /// Settle a processed message.
    fn ack(&mut self, delivery: &Delivery) -> Result<(), BusError>;

    /// Drop a message that cannot be processed, without redelivery.
    fn reject(&mut self, delivery: &Delivery) -> Result<(), BusError>;
}
