use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::thread;

use tracing::{debug, error, info, warn};

use crate::error::{BrokerError, BusError};
use crate::retry::{Cancellation, RetryError, RetryPolicy};

use super::{BrokerConnection, ConnectionEvent, ConnectionSettings, ConnectionState, Connector};

/// Owns the physical broker connection and re-establishes it.
///
/// - `try_connect` runs under a mutex, so at most one connection attempt is
///   in flight; concurrent callers wait and then observe its outcome.
/// - Attempts follow the retry policy; only transient (network-class)
///   errors are retried.
/// - Shutdown, callback-exception and blocked notifications trigger a
///   background `try_connect` unless the connection has been disposed.
/// - `dispose` is terminal. It also cuts short an attempt in progress,
///   which then returns [`BusError::Disposed`].
pub struct ResilientConnection<C: ?Sized + BrokerConnection + 'static> {
    connector: Arc<dyn Connector<C>>,
    settings: ConnectionSettings,
    policy: RetryPolicy,
    connection: RwLock<Option<Arc<C>>>,
    connect_lock: Mutex<()>,
    state: RwLock<ConnectionState>,
    disposed: AtomicBool,
    cancel: Cancellation,
    attempts: AtomicU64,
    this: Weak<Self>,
}

impl<C: ?Sized + BrokerConnection + 'static> ResilientConnection<C> {
    pub fn new(
        connector: Arc<dyn Connector<C>>,
        settings: ConnectionSettings,
        policy: RetryPolicy,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            connector,
            settings,
            policy,
            connection: RwLock::new(None),
            connect_lock: Mutex::new(()),
            state: RwLock::new(ConnectionState::Uninitialized),
            disposed: AtomicBool::new(false),
            cancel: Cancellation::new(),
            attempts: AtomicU64::new(0),
            this: this.clone(),
        })
    }

    /// True iff a connection exists and reports itself open.
    pub fn is_connected(&self) -> bool {
        !self.is_disposed()
            && self
                .connection
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
                .is_some_and(|c| c.is_open())
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConnectionState {
        let state = *self.state.read().unwrap_or_else(PoisonError::into_inner);
        if state == ConnectionState::Connected && !self.is_connected() {
            return ConnectionState::Disconnected;
        }
        state
    }

    /// Connection attempts made over the lifetime of this instance.
    pub fn connect_attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Connect unless already connected.
    ///
    /// `Ok(false)` when every attempt failed transiently; `Err` for a
    /// non-transient failure or after `dispose`.
    pub fn try_connect(&self) -> Result<bool, BusError> {
        self.ensure_not_disposed()?;
        let _guard = self
            .connect_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.ensure_not_disposed()?;

        if self.is_connected() {
            return Ok(true);
        }

        self.set_state(ConnectionState::Connecting);
        info!(client = %self.settings.client_name, "connecting to broker");

        let result = self.policy.run(
            &self.cancel,
            |attempt| {
                self.attempts.fetch_add(1, Ordering::SeqCst);
                debug!(attempt, "broker connection attempt");
                self.connector.connect(&self.settings)
            },
            BrokerError::is_transient,
        );

        match result {
            Ok(connection) => self.install(connection),
            Err(RetryError::Exhausted { attempts, last }) => {
                self.set_state(ConnectionState::Disconnected);
                error!(attempts, error = %last, "could not connect to broker");
                Ok(false)
            }
            Err(RetryError::Aborted { attempts, error }) => {
                self.set_state(ConnectionState::Disconnected);
                error!(attempts, error = %error, "broker connection failed permanently");
                Err(error.into())
            }
            Err(RetryError::Cancelled { attempts }) => {
                debug!(attempts, "connection attempts stopped by dispose");
                Err(BusError::Disposed)
            }
        }
    }

    /// Open a new channel on the active connection. Does not reconnect.
    pub fn create_channel(&self) -> Result<C::Channel, BusError> {
        self.ensure_not_disposed()?;
        let connection = self
            .connection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .filter(|c| c.is_open())
            .ok_or(BusError::NotConnected)?;
        Ok(connection.create_channel()?)
    }

    /// Stop reconnecting and close the connection.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let connection = self
            .connection
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = ConnectionState::Disposed;
        if let Some(connection) = connection {
            connection.close();
        }
        info!(client = %self.settings.client_name, "broker connection disposed");
    }

    fn install(&self, connection: Arc<C>) -> Result<bool, BusError> {
        if self.is_disposed() {
            connection.close();
            return Err(BusError::Disposed);
        }
        if !connection.is_open() {
            self.set_state(ConnectionState::Disconnected);
            return Ok(false);
        }

        let this = self.this.clone();
        connection.subscribe_events(Arc::new(move |event| {
            if let Some(resilient) = this.upgrade() {
                resilient.on_connection_event(event);
            }
        }));

        let previous = self
            .connection
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(connection);
        self.set_state(ConnectionState::Connected);
        info!(client = %self.settings.client_name, "broker connection established");

        if let Some(previous) = previous {
            previous.close();
        }
        Ok(true)
    }

    fn on_connection_event(&self, event: &ConnectionEvent) {
        if self.is_disposed() {
            return;
        }
        warn!(event = %event, "broker connection notification, reconnecting");
        if !self.is_connected() {
            self.set_state(ConnectionState::Disconnected);
        }

        let this = self.this.clone();
        let spawned = thread::Builder::new()
            .name("bus-reconnect".into())
            .spawn(move || {
                let Some(resilient) = this.upgrade() else {
                    return;
                };
                match resilient.try_connect() {
                    Ok(true) | Err(BusError::Disposed) => {}
                    Ok(false) => error!("reconnect gave up, retrying on next use"),
                    Err(err) => error!(error = %err, "reconnect failed"),
                }
            });
        if let Err(err) = spawned {
            error!(error = %err, "could not spawn reconnect thread");
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if *current != ConnectionState::Disposed {
            *current = state;
        }
    }

    fn ensure_not_disposed(&self) -> Result<(), BusError> {
        if self.is_disposed() {
            Err(BusError::Disposed)
        } else {
            Ok(())
        }
    }
}
