//! Subscription registry.
//!
//! Maps wire event names to the concrete event type and to the ordered
//! list of handler types subscribed to it. Generic call sites
//! (`add_subscription::<E, H>()`) are turned into explicit type tags
//! ([`EventType`], [`SubscriptionInfo`]) so the registry itself stores no
//! generics.

mod subscriptions;
mod type_key;

pub use subscriptions::SubscriptionRegistry;
pub use type_key::{DecodedEvent, EventType, SubscriptionInfo, TypeKey};
