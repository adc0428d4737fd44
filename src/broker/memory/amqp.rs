use std::sync::Arc;
use std::time::Duration;

use crate::broker::topic_queue::{AmqpChannel, AmqpConnection};
use crate::broker::{Delivery, Message};
use crate::connection::{BrokerConnection, ConnectionListener, ConnectionSettings, Connector};
use crate::error::BrokerError;

use super::shared::{BrokerControls, ConnectionCore, Core, Filter};

/// In-process exchange/queue broker.
///
/// Cloning shares the broker. Usable wherever a
/// `Connector<AmqpConnection>` is expected.
#[derive(Clone)]
pub struct InMemoryTopicBroker {
    core: Arc<Core>,
}

impl InMemoryTopicBroker {
    pub fn new() -> Self {
        Self { core: Core::new(None) }
    }

    /// Broker that only accepts connections to `endpoint`.
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            core: Core::new(Some(endpoint.into())),
        }
    }

    pub fn controls(&self) -> BrokerControls {
        BrokerControls::new(Arc::clone(&self.core))
    }

    pub fn has_exchange(&self, exchange: &str) -> bool {
        self.core.has_exchange(exchange)
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.core.has_queue(queue)
    }

    /// Routing keys binding `queue`.
    pub fn routing_keys(&self, queue: &str) -> Vec<String> {
        self.core.binding_names(queue)
    }

    /// Ready messages in `queue`.
    pub fn message_count(&self, queue: &str) -> usize {
        self.controls().ready(queue)
    }
}

impl Default for InMemoryTopicBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector<AmqpConnection> for InMemoryTopicBroker {
    fn connect(&self, settings: &ConnectionSettings) -> Result<Arc<AmqpConnection>, BrokerError> {
        let link = self.core.connect(settings)?;
        Ok(Arc::new(MemoryAmqpConnection {
            core: Arc::clone(&self.core),
            link,
        }))
    }
}

struct MemoryAmqpConnection {
    core: Arc<Core>,
    link: Arc<ConnectionCore>,
}

impl BrokerConnection for MemoryAmqpConnection {
    type Channel = Box<dyn AmqpChannel>;

    fn is_open(&self) -> bool {
        self.link.is_open()
    }

    fn create_channel(&self) -> Result<Box<dyn AmqpChannel>, BrokerError> {
        self.link.ensure_open()?;
        Ok(Box::new(MemoryAmqpChannel {
            id: self.core.next_id(),
            core: Arc::clone(&self.core),
            link: Arc::clone(&self.link),
            consuming: Vec::new(),
        }))
    }

    fn subscribe_events(&self, listener: ConnectionListener) {
        self.link.subscribe(listener);
    }

    fn close(&self) {
        self.core.close_connection(&self.link);
    }
}

struct MemoryAmqpChannel {
    id: u64,
    core: Arc<Core>,
    link: Arc<ConnectionCore>,
    consuming: Vec<String>,
}

impl AmqpChannel for MemoryAmqpChannel {
    fn exchange_declare(&mut self, exchange: &str) -> Result<(), BrokerError> {
        self.link.ensure_open()?;
        self.core.declare_exchange(exchange);
        Ok(())
    }

    fn queue_declare(&mut self, queue: &str) -> Result<(), BrokerError> {
        self.link.ensure_open()?;
        self.core.declare_queue(queue);
        Ok(())
    }

    fn queue_bind(
        &mut self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.link.ensure_open()?;
        self.core
            .bind(exchange, queue, routing_key, Filter::Key(routing_key.to_string()))
    }

    fn queue_unbind(
        &mut self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.link.ensure_open()?;
        self.core.unbind(exchange, queue, routing_key);
        Ok(())
    }

    fn basic_publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
        _persistent: bool,
    ) -> Result<(), BrokerError> {
        self.link.ensure_open()?;
        self.core.publish(exchange, routing_key, message)?;
        Ok(())
    }

    fn basic_consume(&mut self, queue: &str) -> Result<(), BrokerError> {
        self.link.ensure_open()?;
        if !self.core.has_queue(queue) {
            return Err(BrokerError::NotFound {
                kind: "queue",
                name: queue.to_string(),
            });
        }
        if !self.consuming.iter().any(|q| q == queue) {
            self.consuming.push(queue.to_string());
        }
        Ok(())
    }

    fn basic_cancel(&mut self, queue: &str) -> Result<(), BrokerError> {
        self.consuming.retain(|q| q != queue);
        Ok(())
    }

    fn next_delivery(&mut self, timeout: Duration) -> Result<Option<Delivery>, BrokerError> {
        self.core.poll(&self.link, self.id, &self.consuming, timeout)
    }

    fn basic_ack(&mut self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.link.ensure_open()?;
        self.core.ack(self.id, delivery_tag)
    }

    fn basic_nack(&mut self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.link.ensure_open()?;
        self.core.nack(self.id, delivery_tag, requeue)
    }
}

impl Drop for MemoryAmqpChannel {
    fn drop(&mut self) {
        self.core.release_channel(self.id);
    }
}
