//! Event bus configuration.
//!
//! `EventConfig` is built once at startup (builder style or deserialized
//! from any serde format) and read by the engine; it never changes
//! afterwards.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which broker backend an engine talks to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerKind {
    /// Exchange/queue broker (direct exchange, one queue per event).
    TopicQueue,
    /// Managed messaging service (topic with one subscription per event).
    Managed,
}

impl std::fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerKind::TopicQueue => write!(f, "topic-queue"),
            BrokerKind::Managed => write!(f, "managed"),
        }
    }
}

/// Wire encoding used for outgoing event payloads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Serializer {
    /// `application/json`
    #[default]
    Json,
    /// `application/x-bitcode`
    Bitcode,
}

/// Immutable event bus configuration.
///
/// ## Example
///
/// ```
/// use integration_bus::{BrokerKind, EventConfig};
///
/// let config = EventConfig::new(BrokerKind::TopicQueue)
///     .with_client_app_name("OrderService")
///     .with_default_topic_name("SellingBuddy")
///     .with_connection_retry_count(5);
///
/// assert_eq!(config.event_name_suffix(), "IntegrationEvent");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    broker_kind: BrokerKind,
    connection_string: String,
    connection_retry_count: u32,
    client_app_name: String,
    default_topic_name: String,
    event_name_prefix: String,
    event_name_suffix: String,
    serializer: Serializer,
    retry_base_delay_ms: u64,
    poll_interval_ms: u64,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self::new(BrokerKind::TopicQueue)
    }
}

impl EventConfig {
    /// Create a configuration for the given broker with default settings.
    pub fn new(broker_kind: BrokerKind) -> Self {
        Self {
            broker_kind,
            connection_string: String::new(),
            connection_retry_count: 5,
            client_app_name: "NetCoreMicroserviceApp".to_string(),
            default_topic_name: "IntegrationEvents".to_string(),
            event_name_prefix: String::new(),
            event_name_suffix: "IntegrationEvent".to_string(),
            serializer: Serializer::Json,
            retry_base_delay_ms: 1000,
            poll_interval_ms: 100,
        }
    }

    pub fn with_connection_string(mut self, value: impl Into<String>) -> Self {
        self.connection_string = value.into();
        self
    }

    /// Number of retries after the first failed attempt (connect and publish).
    pub fn with_connection_retry_count(mut self, count: u32) -> Self {
        self.connection_retry_count = count;
        self
    }

    /// Name of the consuming service; prefixes every queue/subscription name.
    pub fn with_client_app_name(mut self, value: impl Into<String>) -> Self {
        self.client_app_name = value.into();
        self
    }

    /// Exchange (topic/queue broker) or topic (managed broker) events go through.
    pub fn with_default_topic_name(mut self, value: impl Into<String>) -> Self {
        self.default_topic_name = value.into();
        self
    }

    pub fn with_event_name_prefix(mut self, value: impl Into<String>) -> Self {
        self.event_name_prefix = value.into();
        self
    }

    pub fn with_event_name_suffix(mut self, value: impl Into<String>) -> Self {
        self.event_name_suffix = value.into();
        self
    }

    pub fn with_serializer(mut self, serializer: Serializer) -> Self {
        self.serializer = serializer;
        self
    }

    /// Base unit of the exponential backoff (`base * 2^attempt`).
    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay_ms = delay.as_millis() as u64;
        self
    }

    /// How long the consume loop waits for a message before re-checking state.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn broker_kind(&self) -> BrokerKind {
        self.broker_kind
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    pub fn connection_retry_count(&self) -> u32 {
        self.connection_retry_count
    }

    pub fn client_app_name(&self) -> &str {
        &self.client_app_name
    }

    pub fn default_topic_name(&self) -> &str {
        &self.default_topic_name
    }

    pub fn event_name_prefix(&self) -> &str {
        &self.event_name_prefix
    }

    pub fn event_name_suffix(&self) -> &str {
        &self.event_name_suffix
    }

    pub fn serializer(&self) -> Serializer {
        self.serializer
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
