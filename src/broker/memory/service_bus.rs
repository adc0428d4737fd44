use std::sync::Arc;
use std::time::Duration;

use crate::broker::managed::{ServiceBusConnection, ServiceBusSession, DEFAULT_RULE_NAME};
use crate::broker::{Delivery, Message};
use crate::connection::{BrokerConnection, ConnectionListener, ConnectionSettings, Connector};
use crate::error::BrokerError;

use super::shared::{BrokerControls, ConnectionCore, Core, Filter};

/// In-process topic/subscription service.
///
/// Cloning shares the service. New subscriptions receive every message
/// on their topic until their `$Default` rule is replaced.
#[derive(Clone)]
pub struct InMemoryServiceBus {
    core: Arc<Core>,
}

impl InMemoryServiceBus {
    pub fn new() -> Self {
        Self { core: Core::new(None) }
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            core: Core::new(Some(endpoint.into())),
        }
    }

    pub fn controls(&self) -> BrokerControls {
        BrokerControls::new(Arc::clone(&self.core))
    }

    pub fn has_topic(&self, topic: &str) -> bool {
        self.core.has_exchange(topic)
    }

    pub fn has_subscription(&self, topic: &str, subscription: &str) -> bool {
        self.core.has_queue(&entity_path(topic, subscription))
    }

    pub fn rule_names(&self, topic: &str, subscription: &str) -> Vec<String> {
        self.core.binding_names(&entity_path(topic, subscription))
    }

    /// Active messages waiting in a subscription.
    pub fn message_count(&self, topic: &str, subscription: &str) -> usize {
        self.controls().ready(&entity_path(topic, subscription))
    }
}

impl Default for InMemoryServiceBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Queue name backing a subscription.
pub fn entity_path(topic: &str, subscription: &str) -> String {
    format!("{}/Subscriptions/{}", topic, subscription)
}

impl Connector<ServiceBusConnection> for InMemoryServiceBus {
    fn connect(
        &self,
        settings: &ConnectionSettings,
    ) -> Result<Arc<ServiceBusConnection>, BrokerError> {
        let link = self.core.connect(settings)?;
        Ok(Arc::new(MemoryServiceBusConnection {
            core: Arc::clone(&self.core),
            link,
        }))
    }
}

struct MemoryServiceBusConnection {
    core: Arc<Core>,
    link: Arc<ConnectionCore>,
}

impl BrokerConnection for MemoryServiceBusConnection {
    type Channel = Box<dyn ServiceBusSession>;

    fn is_open(&self) -> bool {
        self.link.is_open()
    }

    fn create_channel(&self) -> Result<Box<dyn ServiceBusSession>, BrokerError> {
        self.link.ensure_open()?;
        Ok(Box::new(MemorySession {
            id: self.core.next_id(),
            core: Arc::clone(&self.core),
            link: Arc::clone(&self.link),
            receivers: Vec::new(),
        }))
    }

    fn subscribe_events(&self, listener: ConnectionListener) {
        self.link.subscribe(listener);
    }

    fn close(&self) {
        self.core.close_connection(&self.link);
    }
}

struct MemorySession {
    id: u64,
    core: Arc<Core>,
    link: Arc<ConnectionCore>,
    receivers: Vec<String>,
}

impl MemorySession {
    fn existing_subscription(&self, topic: &str, subscription: &str) -> Result<String, BrokerError> {
        let path = entity_path(topic, subscription);
        if self.core.has_queue(&path) {
            Ok(path)
        } else {
            Err(BrokerError::NotFound {
                kind: "subscription",
                name: path,
            })
        }
    }
}

impl ServiceBusSession for MemorySession {
    fn create_topic_if_missing(&mut self, topic: &str) -> Result<(), BrokerError> {
        self.link.ensure_open()?;
        self.core.declare_exchange(topic);
        Ok(())
    }

    fn create_subscription_if_missing(
        &mut self,
        topic: &str,
        subscription: &str,
    ) -> Result<(), BrokerError> {
        self.link.ensure_open()?;
        if !self.core.has_exchange(topic) {
            return Err(BrokerError::NotFound {
                kind: "topic",
                name: topic.to_string(),
            });
        }
        let path = entity_path(topic, subscription);
        if !self.core.has_queue(&path) {
            self.core.declare_queue(&path);
            self.core.bind(topic, &path, DEFAULT_RULE_NAME, Filter::All)?;
        }
        Ok(())
    }

    fn rules(&mut self, topic: &str, subscription: &str) -> Result<Vec<String>, BrokerError> {
        self.link.ensure_open()?;
        let path = self.existing_subscription(topic, subscription)?;
        Ok(self.core.binding_names(&path))
    }

    fn create_rule(
        &mut self,
        topic: &str,
        subscription: &str,
        rule: &str,
        label: &str,
    ) -> Result<(), BrokerError> {
        self.link.ensure_open()?;
        let path = self.existing_subscription(topic, subscription)?;
        self.core.bind(topic, &path, rule, Filter::Key(label.to_string()))
    }

    fn delete_rule(&mut self, topic: &str, subscription: &str, rule: &str)
        -> Result<(), BrokerError> {
        self.link.ensure_open()?;
        let path = self.existing_subscription(topic, subscription)?;
        if self.core.unbind(topic, &path, rule) {
            Ok(())
        } else {
            Err(BrokerError::NotFound {
                kind: "rule",
                name: rule.to_string(),
            })
        }
    }

    fn delete_subscription(&mut self, topic: &str, subscription: &str) -> Result<(), BrokerError> {
        self.link.ensure_open()?;
        let path = entity_path(topic, subscription);
        self.receivers.retain(|r| *r != path);
        if self.core.delete_queue(&path) {
            Ok(())
        } else {
            Err(BrokerError::NotFound {
                kind: "subscription",
                name: path,
            })
        }
    }

    fn send(&mut self, topic: &str, message: &Message) -> Result<(), BrokerError> {
        self.link.ensure_open()?;
        self.core.publish(topic, &message.event_name, message)?;
        Ok(())
    }

    fn open_receiver(&mut self, topic: &str, subscription: &str) -> Result<(), BrokerError> {
        self.link.ensure_open()?;
        let path = self.existing_subscription(topic, subscription)?;
        if !self.receivers.contains(&path) {
            self.receivers.push(path);
        }
        Ok(())
    }

    fn close_receiver(&mut self, topic: &str, subscription: &str) -> Result<(), BrokerError> {
        let path = entity_path(topic, subscription);
        self.receivers.retain(|r| *r != path);
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> Result<Option<Delivery>, BrokerError> {
        self.core.poll(&self.link, self.id, &self.receivers, timeout)
    }

    fn complete(&mut self, lock_token: u64) -> Result<(), BrokerError> {
        self.link.ensure_open()?;
        self.core.ack(self.id, lock_token)
    }

    fn dead_letter(&mut self, lock_token: u64, _reason: &str) -> Result<(), BrokerError> {
        self.link.ensure_open()?;
        self.core.nack(self.id, lock_token, false)
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.core.release_channel(self.id);
    }
}
