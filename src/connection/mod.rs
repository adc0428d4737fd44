//! Broker connections.
//!
//! A physical connection is produced by a [`Connector`] and owned by a
//! [`ResilientConnection`], which hides transient unavailability from the
//! rest of the bus. The connection type is a trait object whose
//! `Channel` is the broker-specific session type, e.g.
//! `dyn BrokerConnection<Channel = Box<dyn AmqpChannel>>`.

mod resilient;

use std::fmt;
use std::sync::Arc;

use crate::config::EventConfig;
use crate::error::BrokerError;

pub use resilient::ResilientConnection;

/// Asynchronous notification raised by a live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The connection was shut down (by the broker or the network).
    Shutdown(String),
    /// A broker callback on this connection failed.
    CallbackException(String),
    /// The broker blocked the connection (flow control).
    Blocked(String),
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionEvent::Shutdown(reason) => write!(f, "shutdown: {}", reason),
            ConnectionEvent::CallbackException(reason) => {
                write!(f, "callback exception: {}", reason)
            }
            ConnectionEvent::Blocked(reason) => write!(f, "blocked: {}", reason),
        }
    }
}

pub type ConnectionListener = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

/// An open connection to a broker.
pub trait BrokerConnection: Send + Sync {
    /// Logical channel/session type opened on this connection.
    type Channel;

    fn is_open(&self) -> bool;

    fn create_channel(&self) -> Result<Self::Channel, BrokerError>;

    /// Register a listener for shutdown, callback-exception and blocked
    /// notifications.
    fn subscribe_events(&self, listener: ConnectionListener);

    fn close(&self);
}

/// Opens physical connections.
pub trait Connector<C: ?Sized>: Send + Sync {
    fn connect(&self, settings: &ConnectionSettings) -> Result<Arc<C>, BrokerError>;
}

/// What a connector needs to know to open a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub connection_string: String,
    /// Client-provided connection name, shown in broker tooling.
    pub client_name: String,
}

impl ConnectionSettings {
    pub fn from_config(config: &EventConfig) -> Self {
        Self {
            connection_string: config.connection_string().to_string(),
            client_name: config.client_app_name().to_string(),
        }
    }
}

/// Lifecycle of a resilient connection (and of the engine above it).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Connecting,
    Connected,
    Disconnected,
    Disposed,
}
