//! Error types shared across the bus.

use thiserror::Error;

use crate::config::BrokerKind;

/// Failure reported by a broker transport.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker could not be reached (socket failure, DNS, refused).
    #[error("broker unreachable: {0}")]
    Unreachable(String),
    /// The connection or channel was closed underneath the caller.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),
    /// The broker is applying flow control to this connection.
    #[error("connection blocked: {0}")]
    Blocked(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// A topology element the operation needs does not exist.
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },
    /// The connection string is malformed or points at the wrong broker.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    /// The broker refused the operation.
    #[error("rejected by broker: {0}")]
    Rejected(String),
}

impl BrokerError {
    /// Network-class errors; the only ones worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::Unreachable(_)
                | BrokerError::ConnectionClosed(_)
                | BrokerError::Blocked(_)
                | BrokerError::Io(_)
        )
    }
}

/// Misuse of the subscription registry. These are programming errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("event name `{event_name}` is bound to `{existing}`, cannot rebind to `{requested}`")]
    EventNameCollision {
        event_name: String,
        existing: &'static str,
        requested: &'static str,
    },
    #[error("handler `{handler}` already registered for `{event_name}`")]
    HandlerAlreadyRegistered {
        event_name: String,
        handler: &'static str,
    },
    #[error("no event type registered under `{0}`")]
    UnknownEvent(String),
}

/// Payload encode/decode failure.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bitcode: {0}")]
    Bitcode(#[from] bitcode::Error),
    #[error("unsupported content type `{0}`")]
    UnsupportedContentType(String),
}

/// Error returned by the event bus engine.
#[derive(Debug, Error)]
pub enum BusError {
    /// The bus (or its connection) has been disposed.
    #[error("event bus disposed")]
    Disposed,
    /// An operation needed an open connection and there is none.
    #[error("not connected to broker")]
    NotConnected,
    /// Connecting failed after every retry.
    #[error("could not connect to {kind} broker")]
    ConnectionUnavailable { kind: BrokerKind },
    #[error("publishing `{event_name}` failed after {attempts} attempt(s): {source}")]
    PublishFailed {
        event_name: String,
        attempts: u32,
        #[source]
        source: Box<BusError>,
    },
    /// The factory was asked for a broker kind it has no transport for.
    #[error("no transport configured for {0} broker")]
    TransportMissing(BrokerKind),
    #[error("could not start consumer thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl BusError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            BusError::NotConnected => true,
            BusError::Broker(err) => err.is_transient(),
            _ => false,
        }
    }
}
