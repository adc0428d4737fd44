use std::sync::Arc;

use tracing::info;

use crate::broker::{
    AmqpConnection, BrokerAdapter, ManagedBroker, ServiceBusConnection, TopicQueueBroker,
};
use crate::config::{BrokerKind, EventConfig};
use crate::connection::Connector;
use crate::error::BusError;
use crate::handler::HandlerResolver;

use super::EventBus;

/// Connectors the factory can choose from. Only the one matching the
/// configured broker kind is used.
#[derive(Default, Clone)]
pub struct Transports {
    topic_queue: Option<Arc<dyn Connector<AmqpConnection>>>,
    managed: Option<Arc<dyn Connector<ServiceBusConnection>>>,
}

impl Transports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_topic_queue(mut self, connector: Arc<dyn Connector<AmqpConnection>>) -> Self {
        self.topic_queue = Some(connector);
        self
    }

    pub fn with_managed(mut self, connector: Arc<dyn Connector<ServiceBusConnection>>) -> Self {
        self.managed = Some(connector);
        self
    }
}

/// Builds an [`EventBus`] for the broker named in the config.
pub struct EventBusFactory;

impl EventBusFactory {
    pub fn create(
        config: EventConfig,
        resolver: Arc<dyn HandlerResolver>,
        transports: Transports,
    ) -> Result<Arc<EventBus>, BusError> {
        let config = Arc::new(config);
        let kind = config.broker_kind();

        let broker: Arc<dyn BrokerAdapter> = match kind {
            BrokerKind::TopicQueue => {
                let connector = transports
                    .topic_queue
                    .ok_or(BusError::TransportMissing(kind))?;
                Arc::new(TopicQueueBroker::new(Arc::clone(&config), connector))
            }
            BrokerKind::Managed => {
                let connector = transports
                    .managed
                    .ok_or(BusError::TransportMissing(kind))?;
                Arc::new(ManagedBroker::new(Arc::clone(&config), connector))
            }
        };

        info!(
            broker = %kind,
            client = config.client_app_name(),
            topic = config.default_topic_name(),
            "event bus created"
        );
        Ok(Arc::new(EventBus::new(config, broker, resolver)))
    }
}
