use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, error, info, warn};

use crate::broker::{BrokerAdapter, Message};
use crate::config::{BrokerKind, EventConfig};
use crate::connection::ConnectionState;
use crate::error::{BusError, RegistryError};
use crate::event::IntegrationEvent;
use crate::handler::{HandlerResolver, IntegrationEventHandler};
use crate::registry::{SubscriptionRegistry, TypeKey};
use crate::retry::{Cancellation, RetryError, RetryPolicy};

use super::consumer::{ConsumeLoop, ConsumerHandle, ConsumerStats};

/// Publish/subscribe engine over one broker adapter.
///
/// - `publish` serializes an event, names it through the registry and sends
///   it, retrying transient send failures with the connection's backoff.
/// - `subscribe` registers a handler type; the first handler of an event
///   declares its broker binding and starts the consume loop.
/// - `unsubscribe` removes a handler type; the last one removes the binding.
/// - `dispose` stops the consume loop and the connection. Every operation
///   afterwards fails with [`BusError::Disposed`].
///
/// Handlers are resolved through the [`HandlerResolver`] for every
/// delivery; the bus never keeps handler instances.
///
/// Registry changes and the binding declarations that follow them run
/// under one topology lock, shared with the consume loop, so a binding
/// always matches the registry once the call returns.
///
/// ## Example
///
/// ```ignore
/// let bus = EventBusFactory::create(config, resolver, transports)?;
///
/// bus.subscribe::<OrderStartedIntegrationEvent, OrderStartedHandler>()?;
/// bus.publish(&OrderStartedIntegrationEvent::new(order_id))?;
///
/// let stats = bus.dispose();
/// ```
pub struct EventBus {
    config: Arc<EventConfig>,
    registry: Arc<SubscriptionRegistry>,
    broker: Arc<dyn BrokerAdapter>,
    resolver: Arc<dyn HandlerResolver>,
    publish_policy: RetryPolicy,
    cancel: Cancellation,
    topology: Arc<Mutex<()>>,
    consumer: Mutex<Option<ConsumerHandle>>,
    disposed: AtomicBool,
}

impl EventBus {
    pub fn new(
        config: Arc<EventConfig>,
        broker: Arc<dyn BrokerAdapter>,
        resolver: Arc<dyn HandlerResolver>,
    ) -> Self {
        let registry = Arc::new(SubscriptionRegistry::from_config(&config));

        let unbind = Arc::clone(&broker);
        registry.on_event_removed(move |event_name| {
            match unbind.remove_binding(event_name) {
                Ok(()) => debug!(event_name, "binding removed"),
                Err(err) => warn!(event_name, error = %err, "could not remove binding"),
            }
        });

        let publish_policy =
            RetryPolicy::new(config.connection_retry_count(), config.retry_base_delay());

        Self {
            config,
            registry,
            broker,
            resolver,
            publish_policy,
            cancel: Cancellation::new(),
            topology: Arc::new(Mutex::new(())),
            consumer: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &EventConfig {
        &self.config
    }

    pub fn broker_kind(&self) -> BrokerKind {
        self.broker.kind()
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn state(&self) -> ConnectionState {
        if self.is_disposed() {
            ConnectionState::Disposed
        } else {
            self.broker.connection_state()
        }
    }

    pub fn is_connected(&self) -> bool {
        !self.is_disposed() && self.broker.is_connected()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Whether the consume loop thread is alive.
    pub fn is_consuming(&self) -> bool {
        self.consumer_slot().as_ref().is_some_and(ConsumerHandle::is_running)
    }

    /// Connect to the broker now instead of on first use.
    pub fn try_connect(&self) -> Result<bool, BusError> {
        self.ensure_active()?;
        self.broker.try_connect()
    }

    /// Publish `event` under its derived name.
    ///
    /// Connects first if needed. Transient send failures are retried up to
    /// `connection_retry_count` times; afterwards the last error is
    /// returned inside [`BusError::PublishFailed`]. A concurrent
    /// `dispose` ends the retries with [`BusError::Disposed`].
    pub fn publish<E: IntegrationEvent>(&self, event: &E) -> Result<(), BusError> {
        self.ensure_active()?;

        let event_name = self.registry.event_key::<E>();
        let serializer = self.config.serializer();
        let payload = serializer.encode(event)?;
        let message = Message::new(
            event.id().to_string(),
            event_name.as_str(),
            serializer.content_type(),
            payload,
        );

        let sent = self.publish_policy.run(
            &self.cancel,
            |attempt| {
                if attempt > 1 {
                    debug!(event_name = %event_name, attempt, "retrying publish");
                }
                self.broker.publish(&message)
            },
            BusError::is_transient,
        );

        match sent {
            Ok(()) => {
                debug!(event_name = %event_name, event_id = %message.id, "event published");
                Ok(())
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                error!(event_name = %event_name, attempts, error = %last, "publish failed");
                Err(BusError::PublishFailed {
                    event_name,
                    attempts,
                    source: Box::new(last),
                })
            }
            Err(RetryError::Aborted { error, .. }) => {
                error!(event_name = %event_name, error = %error, "publish failed");
                Err(error)
            }
            Err(RetryError::Cancelled { attempts }) => {
                debug!(event_name = %event_name, attempts, "publish stopped by dispose");
                Err(BusError::Disposed)
            }
        }
    }

    /// Register `H` as a handler of `E` and make sure messages flow.
    ///
    /// Subscribing an already registered pair is a no-op. An event whose
    /// derived name is taken by another type is an error.
    pub fn subscribe<E, H>(&self) -> Result<(), BusError>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        self.ensure_active()?;
        let event_name = self.registry.event_key::<E>();
        let handler = TypeKey::of::<H>();

        let topology = lock(&self.topology);
        match self.registry.add_subscription::<E, H>() {
            Ok(true) => {
                info!(event_name = %event_name, handler = %handler, "subscribed");
                if let Err(err) = self.broker.declare_binding(&event_name) {
                    warn!(
                        event_name = %event_name,
                        error = %err,
                        "binding not declared yet, the consumer will retry"
                    );
                }
            }
            Ok(false) => {
                info!(event_name = %event_name, handler = %handler, "handler added");
            }
            Err(RegistryError::HandlerAlreadyRegistered { .. }) => {
                warn!(event_name = %event_name, handler = %handler, "already subscribed");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }
        drop(topology);

        self.ensure_consumer()
    }

    /// Remove `H` from the handlers of `E`. Returns whether it was
    /// registered. The consume loop keeps running.
    pub fn unsubscribe<E, H>(&self) -> Result<bool, BusError>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        self.ensure_active()?;
        // The registry's removal listener unbinds while this is held.
        let _topology = lock(&self.topology);
        let removed = self.registry.remove_subscription::<E, H>();
        if removed {
            info!(
                event_name = %self.registry.event_key::<E>(),
                handler = %TypeKey::of::<H>(),
                "unsubscribed"
            );
        }
        Ok(removed)
    }

    /// Stop consuming, clear subscriptions and close the connection.
    ///
    /// A handler running at this moment is allowed to finish; no further
    /// message starts processing. Returns the consume loop's stats, or
    /// zeroes when it never ran or the bus was already disposed.
    pub fn dispose(&self) -> ConsumerStats {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return ConsumerStats::default();
        }

        self.cancel.cancel();
        let consumer = self.consumer_slot().take();
        if let Some(consumer) = &consumer {
            consumer.signal_stop();
        }
        self.broker.dispose();
        let stats = consumer.map(ConsumerHandle::stop).unwrap_or_default();
        self.registry.clear();

        info!(broker = %self.broker.kind(), "event bus disposed");
        stats
    }

    fn ensure_consumer(&self) -> Result<(), BusError> {
        let mut slot = self.consumer_slot();
        if slot.as_ref().is_some_and(ConsumerHandle::is_running) {
            return Ok(());
        }
        // Another thread may have disposed while we registered.
        self.ensure_active()?;

        let consume = ConsumeLoop {
            broker: Arc::clone(&self.broker),
            registry: Arc::clone(&self.registry),
            resolver: Arc::clone(&self.resolver),
            topology: Arc::clone(&self.topology),
            poll_interval: self.config.poll_interval(),
            reopen_delay: self.config.retry_base_delay(),
        };
        *slot = Some(consume.spawn()?);
        Ok(())
    }

    fn consumer_slot(&self) -> MutexGuard<'_, Option<ConsumerHandle>> {
        lock(&self.consumer)
    }

    fn ensure_active(&self) -> Result<(), BusError> {
        if self.is_disposed() {
            Err(BusError::Disposed)
        } else {
            Ok(())
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.dispose();
    }
}
