//! Topic/queue broker adapter.
//!
//! Topology: one direct exchange named after the default topic, one
//! durable queue per event named `{client_app}.{event}`, bound with the
//! event name as routing key. Publishing declares the same queue and
//! binding so events sent before the consumer starts are kept.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::config::{BrokerKind, EventConfig};
use crate::connection::{BrokerConnection, ConnectionSettings, ConnectionState, Connector, ResilientConnection};
use crate::error::{BrokerError, BusError};
use crate::event::naming::subscription_name;
use crate::retry::RetryPolicy;

use super::{BrokerAdapter, BrokerConsumer, Delivery, Message};

/// Channel on an exchange/queue broker connection.
pub trait AmqpChannel: Send {
    /// Declare a durable direct exchange. Idempotent.
    fn exchange_declare(&mut self, exchange: &str) -> Result<(), BrokerError>;

    /// Declare a durable queue. Idempotent.
    fn queue_declare(&mut self, queue: &str) -> Result<(), BrokerError>;

    fn queue_bind(&mut self, queue: &str, exchange: &str, routing_key: &str)
        -> Result<(), BrokerError>;

    fn queue_unbind(
        &mut self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    fn basic_publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
        persistent: bool,
    ) -> Result<(), BrokerError>;

    /// Start consuming `queue` on this channel.
    fn basic_consume(&mut self, queue: &str) -> Result<(), BrokerError>;

    fn basic_cancel(&mut self, queue: &str) -> Result<(), BrokerError>;

    /// Next delivery from any consumed queue, waiting up to `timeout`.
    fn next_delivery(&mut self, timeout: Duration) -> Result<Option<Delivery>, BrokerError>;

    fn basic_ack(&mut self, delivery_tag: u64) -> Result<(), BrokerError>;

    fn basic_nack(&mut self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;
}

pub type AmqpConnection = dyn BrokerConnection<Channel = Box<dyn AmqpChannel>>;

/// Adapter for exchange/queue brokers.
pub struct TopicQueueBroker {
    config: Arc<EventConfig>,
    connection: Arc<ResilientConnection<AmqpConnection>>,
}

impl TopicQueueBroker {
    pub fn new(config: Arc<EventConfig>, connector: Arc<dyn Connector<AmqpConnection>>) -> Self {
        let policy = RetryPolicy::new(config.connection_retry_count(), config.retry_base_delay());
        let connection =
            ResilientConnection::new(connector, ConnectionSettings::from_config(&config), policy);
        Self { config, connection }
    }

    pub fn connection(&self) -> &Arc<ResilientConnection<AmqpConnection>> {
        &self.connection
    }

    fn channel(&self) -> Result<Box<dyn AmqpChannel>, BusError> {
        if !self.connection.is_connected() && !self.connection.try_connect()? {
            return Err(BusError::ConnectionUnavailable {
                kind: BrokerKind::TopicQueue,
            });
        }
        self.connection.create_channel()
    }

    fn queue_name(&self, event_name: &str) -> String {
        subscription_name(self.config.client_app_name(), event_name)
    }

    fn declare(&self, channel: &mut dyn AmqpChannel, event_name: &str) -> Result<(), BrokerError> {
        let exchange = self.config.default_topic_name();
        let queue = self.queue_name(event_name);
        channel.exchange_declare(exchange)?;
        channel.queue_declare(&queue)?;
        channel.queue_bind(&queue, exchange, event_name)?;
        debug!(exchange, queue = %queue, routing_key = event_name, "queue bound");
        Ok(())
    }
}

impl BrokerAdapter for TopicQueueBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::TopicQueue
    }

    fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    fn try_connect(&self) -> Result<bool, BusError> {
        self.connection.try_connect()
    }

    fn publish(&self, message: &Message) -> Result<(), BusError> {
        let mut channel = self.channel()?;
        self.declare(channel.as_mut(), &message.event_name)?;
        channel.basic_publish(
            self.config.default_topic_name(),
            &message.event_name,
            message,
            true,
        )?;
        Ok(())
    }

    fn declare_binding(&self, event_name: &str) -> Result<(), BusError> {
        let mut channel = self.channel()?;
        self.declare(channel.as_mut(), event_name)?;
        Ok(())
    }

    fn remove_binding(&self, event_name: &str) -> Result<(), BusError> {
        let mut channel = self.channel()?;
        let queue = self.queue_name(event_name);
        channel.queue_unbind(&queue, self.config.default_topic_name(), event_name)?;
        debug!(queue = %queue, routing_key = event_name, "queue unbound");
        Ok(())
    }

    fn open_consumer(&self) -> Result<Box<dyn BrokerConsumer>, BusError> {
        let mut channel = self.channel()?;
        channel.exchange_declare(self.config.default_topic_name())?;
        Ok(Box::new(TopicQueueConsumer {
            channel,
            client_app_name: self.config.client_app_name().to_string(),
        }))
    }

    fn dispose(&self) {
        self.connection.dispose();
    }
}

struct TopicQueueConsumer {
    channel: Box<dyn AmqpChannel>,
    client_app_name: String,
}

impl BrokerConsumer for TopicQueueConsumer {
    fn listen(&mut self, event_name: &str) -> Result<(), BusError> {
        let queue = subscription_name(&self.client_app_name, event_name);
        self.channel.basic_consume(&queue)?;
        Ok(())
    }

    fn unlisten(&mut self, event_name: &str) -> Result<(), BusError> {
        let queue = subscription_name(&self.client_app_name, event_name);
        self.channel.basic_cancel(&queue)?;
        Ok(())
    }

    fn next(&mut self, timeout: Duration) -> Result<Option<Delivery>, BusError> {
        Ok(self.channel.next_delivery(timeout)?)
    }

    fn ack(&mut self, delivery: &Delivery) -> Result<(), BusError> {
        Ok(self.channel.basic_ack(delivery.tag)?)
    }

    fn reject(&mut self, delivery: &Delivery) -> Result<(), BusError> {
        Ok(self.channel.basic_nack(delivery.tag, false)?)
    }
}
