//! Event bus integration tests against the in-memory brokers.

mod lifecycle;
mod managed;
mod publish_subscribe;
mod reconnect;
