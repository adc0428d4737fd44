//! Managed messaging service adapter.
//!
//! Topology: one topic named after the default topic, one subscription
//! per event named `{client_app}.{event}`. A new subscription comes with a
//! catch-all `$Default` rule; it is replaced by a rule named after the
//! event that filters on the message label. Messages are received in
//! peek-lock mode and completed or dead-lettered by lock token.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::config::{BrokerKind, EventConfig};
use crate::connection::{BrokerConnection, ConnectionSettings, ConnectionState, Connector, ResilientConnection};
use crate::error::{BrokerError, BusError};
use crate::event::naming::subscription_name;
use crate::retry::RetryPolicy;

use super::{BrokerAdapter, BrokerConsumer, Delivery, Message};

/// Name of the catch-all rule every new subscription starts with.
pub const DEFAULT_RULE_NAME: &str = "$Default";

/// Session on a managed messaging connection: management operations,
/// sending and peek-lock receiving.
pub trait ServiceBusSession: Send {
    fn create_topic_if_missing(&mut self, topic: &str) -> Result<(), BrokerError>;

    fn create_subscription_if_missing(
        &mut self,
        topic: &str,
        subscription: &str,
    ) -> Result<(), BrokerError>;

    /// Rule names on a subscription.
    fn rules(&mut self, topic: &str, subscription: &str) -> Result<Vec<String>, BrokerError>;

    /// Add a rule matching messages whose label equals `label`.
    fn create_rule(
        &mut self,
        topic: &str,
        subscription: &str,
        rule: &str,
        label: &str,
    ) -> Result<(), BrokerError>;

    fn delete_rule(&mut self, topic: &str, subscription: &str, rule: &str)
        -> Result<(), BrokerError>;

    fn delete_subscription(&mut self, topic: &str, subscription: &str) -> Result<(), BrokerError>;

    /// Send to a topic; the label is the message's event name.
    fn send(&mut self, topic: &str, message: &Message) -> Result<(), BrokerError>;

    fn open_receiver(&mut self, topic: &str, subscription: &str) -> Result<(), BrokerError>;

    fn close_receiver(&mut self, topic: &str, subscription: &str) -> Result<(), BrokerError>;

    /// Next locked message from any open receiver, waiting up to `timeout`.
    fn receive(&mut self, timeout: Duration) -> Result<Option<Delivery>, BrokerError>;

    fn complete(&mut self, lock_token: u64) -> Result<(), BrokerError>;

    fn dead_letter(&mut self, lock_token: u64, reason: &str) -> Result<(), BrokerError>;
}

pub type ServiceBusConnection = dyn BrokerConnection<Channel = Box<dyn ServiceBusSession>>;

/// Adapter for managed topic/subscription services.
pub struct ManagedBroker {
    config: Arc<EventConfig>,
    connection: Arc<ResilientConnection<ServiceBusConnection>>,
}

impl ManagedBroker {
    pub fn new(
        config: Arc<EventConfig>,
        connector: Arc<dyn Connector<ServiceBusConnection>>,
    ) -> Self {
        let policy = RetryPolicy::new(config.connection_retry_count(), config.retry_base_delay());
        let connection =
            ResilientConnection::new(connector, ConnectionSettings::from_config(&config), policy);
        Self { config, connection }
    }

    pub fn connection(&self) -> &Arc<ResilientConnection<ServiceBusConnection>> {
        &self.connection
    }

    fn session(&self) -> Result<Box<dyn ServiceBusSession>, BusError> {
        if !self.connection.is_connected() && !self.connection.try_connect()? {
            return Err(BusError::ConnectionUnavailable {
                kind: BrokerKind::Managed,
            });
        }
        self.connection.create_channel()
    }

    fn subscription_name(&self, event_name: &str) -> String {
        subscription_name(self.config.client_app_name(), event_name)
    }
}

fn ignore_missing(result: Result<(), BrokerError>) -> Result<(), BrokerError> {
    match result {
        Err(BrokerError::NotFound { .. }) => Ok(()),
        other => other,
    }
}

impl BrokerAdapter for ManagedBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Managed
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
        let mut session = self.session()?;
        let topic = self.config.default_topic_name();
        session.create_topic_if_missing(topic)?;
        session.send(topic, message)?;
        Ok(())
    }

    fn declare_binding(&self, event_name: &str) -> Result<(), BusError> {
        let mut session = self.session()?;
        let topic = self.config.default_topic_name();
        let subscription = self.subscription_name(event_name);

        session.create_topic_if_missing(topic)?;
        session.create_subscription_if_missing(topic, &subscription)?;

        let rules = session.rules(topic, &subscription)?;
        if rules.iter().any(|r| r == DEFAULT_RULE_NAME) {
            ignore_missing(session.delete_rule(topic, &subscription, DEFAULT_RULE_NAME))?;
        }
        if !rules.iter().any(|r| r == event_name) {
            session.create_rule(topic, &subscription, event_name, event_name)?;
        }
        debug!(topic, subscription = %subscription, rule = event_name, "subscription ready");
        Ok(())
    }

    fn remove_binding(&self, event_name: &str) -> Result<(), BusError> {
        let mut session = self.session()?;
        let topic = self.config.default_topic_name();
        let subscription = self.subscription_name(event_name);

        ignore_missing(session.delete_rule(topic, &subscription, event_name))?;
        ignore_missing(session.delete_subscription(topic, &subscription))?;
        debug!(topic, subscription = %subscription, "subscription removed");
        Ok(())
    }

    fn open_consumer(&self) -> Result<Box<dyn BrokerConsumer>, BusError> {
        let session = self.session()?;
        Ok(Box::new(ManagedConsumer {
            session,
            topic: self.config.default_topic_name().to_string(),
            client_app_name: self.config.client_app_name().to_string(),
            receivers: HashMap::new(),
        }))
    }

    fn dispose(&self) {
        self.connection.dispose();
    }
}

struct ManagedConsumer {
    session: Box<dyn ServiceBusSession>,
    topic: String,
    client_app_name: String,
    /// event name -> subscription name of open receivers
    receivers: HashMap<String, String>,
}

impl BrokerConsumer for ManagedConsumer {
    fn listen(&mut self, event_name: &str) -> Result<(), BusError> {
        let subscription = subscription_name(&self.client_app_name, event_name);
        self.session.open_receiver(&self.topic, &subscription)?;
        self.receivers.insert(event_name.to_string(), subscription);
        Ok(())
    }

    fn unlisten(&mut self, event_name: &str) -> Result<(), BusError> {
        if let Some(subscription) = self.receivers.remove(event_name) {
            ignore_missing(self.session.close_receiver(&self.topic, &subscription))?;
        }
        Ok(())
    }

    fn next(&mut self, timeout: Duration) -> Result<Option<Delivery>, BusError> {
        Ok(self.session.receive(timeout)?)
    }

    fn ack(&mut self, delivery: &Delivery) -> Result<(), BusError> {
        Ok(self.session.complete(delivery.tag)?)
    }

    fn reject(&mut self, delivery: &Delivery) -> Result<(), BusError> {
        Ok(self
            .session
            .dead_letter(delivery.tag, "no handler could process the message")?)
    }
}
