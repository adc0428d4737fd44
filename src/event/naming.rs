//! Wire names for events.
//!
//! The broker addresses an event by its type name with a configured prefix
//! and suffix stripped: `OrderCreatedIntegrationEvent` travels as
//! `OrderCreated` when the suffix is `IntegrationEvent`. These are pure
//! string functions with no broker involvement.

use crate::config::EventConfig;

use super::IntegrationEvent;

/// Strip `prefix` and `suffix` from `type_name`.
///
/// Stripping is by exact substring. A name that would become empty is kept
/// as it was.
pub fn event_name(type_name: &str, prefix: &str, suffix: &str) -> String {
    let mut name = type_name;
    if !prefix.is_empty() {
        name = name.strip_prefix(prefix).unwrap_or(name);
    }
    if !suffix.is_empty() {
        name = name.strip_suffix(suffix).unwrap_or(name);
    }
    if name.is_empty() {
        return type_name.to_string();
    }
    name.to_string()
}

/// Queue (topic/queue broker) or subscription (managed broker) name a
/// consuming service reads `event_name` from.
pub fn subscription_name(client_app_name: &str, event_name: &str) -> String {
    format!("{}.{}", client_app_name, event_name)
}

/// Name derivation bound to one configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EventNaming {
    prefix: String,
    suffix: String,
}

impl EventNaming {
    pub fn new(prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            suffix: suffix.into(),
        }
    }

    pub fn from_config(config: &EventConfig) -> Self {
        Self::new(config.event_name_prefix(), config.event_name_suffix())
    }

    pub fn name_of(&self, type_name: &str) -> String {
        event_name(type_name, &self.prefix, &self.suffix)
    }

    /// Wire name of event type `E`.
    pub fn key<E: IntegrationEvent>(&self) -> String {
        self.name_of(E::TYPE_NAME)
    }
}
