//! Connection state and disposal.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use integration_bus::{
    BrokerKind, BusError, ConnectionState, ConsumerStats, EventConfig, HandlerProvider,
};

use crate::support::*;

#[test]
fn operations_after_dispose_fail() {
    let (bus, _broker) = topic_queue_bus(fast_config(BrokerKind::TopicQueue), HandlerProvider::new());
    bus.dispose();

    assert_eq!(bus.state(), ConnectionState::Disposed);
    assert!(matches!(
        bus.publish(&OrderCreatedIntegrationEvent::new(1, "alice")),
        Err(BusError::Disposed)
    ));
    assert!(matches!(
        bus.subscribe::<OrderCreatedIntegrationEvent, Recorder<OrderCreatedIntegrationEvent>>(),
        Err(BusError::Disposed)
    ));
    assert!(matches!(
        bus.unsubscribe::<OrderCreatedIntegrationEvent, Recorder<OrderCreatedIntegrationEvent>>(),
        Err(BusError::Disposed)
    ));
    assert!(matches!(bus.try_connect(), Err(BusError::Disposed)));
    assert_eq!(bus.dispose(), ConsumerStats::default());
}

#[test]
fn state_follows_the_connection() {
    let (bus, broker) = topic_queue_bus(
        fast_config(BrokerKind::TopicQueue).with_connection_retry_count(1),
        HandlerProvider::new(),
    );
    let controls = broker.controls();
    assert_eq!(bus.state(), ConnectionState::Uninitialized);

    assert!(bus.try_connect().unwrap());
    assert_eq!(bus.state(), ConnectionState::Connected);

    controls.set_reachable(false);
    controls.drop_connections("link down");
    assert!(wait_until(|| matches!(
        bus.state(),
        ConnectionState::Disconnected | ConnectionState::Connecting
    )));

    controls.set_reachable(true);
    assert!(bus.try_connect().unwrap());
    assert_eq!(bus.state(), ConnectionState::Connected);

    bus.dispose();
    assert_eq!(bus.state(), ConnectionState::Disposed);
}

#[test]
fn dispose_stops_the_consumer_and_closes_the_connection() {
    let (bus, broker) = topic_queue_bus(fast_config(BrokerKind::TopicQueue), HandlerProvider::new());
    bus.subscribe::<OrderCreatedIntegrationEvent, Recorder<OrderCreatedIntegrationEvent>>()
        .unwrap();
    assert!(bus.is_consuming());

    bus.dispose();

    assert!(!bus.is_consuming());
    assert!(!bus.is_connected());
    assert!(bus.registry().is_empty());
    assert_eq!(broker.controls().open_connections(), 0);
}

#[test]
fn dispose_lets_a_running_handler_finish() {
    let slow = Arc::new(SlowHandler::default());
    let (bus, _broker) = topic_queue_bus(
        fast_config(BrokerKind::TopicQueue),
        HandlerProvider::new().singleton(Arc::clone(&slow)),
    );
    bus.subscribe::<OrderCreatedIntegrationEvent, SlowHandler>().unwrap();
    bus.publish(&OrderCreatedIntegrationEvent::new(1, "alice")).unwrap();
    assert!(wait_until(|| slow.started.load(Ordering::SeqCst)));

    let stats = bus.dispose();

    assert!(slow.finished.load(Ordering::SeqCst));
    assert_eq!(stats.handled, 1);
}

#[test]
fn dropping_the_bus_disposes_it() {
    let (bus, broker) = topic_queue_bus(fast_config(BrokerKind::TopicQueue), HandlerProvider::new());
    bus.subscribe::<OrderCreatedIntegrationEvent, Recorder<OrderCreatedIntegrationEvent>>()
        .unwrap();
    assert!(wait_until(|| broker.controls().open_connections() == 1));

    drop(bus);

    assert_eq!(broker.controls().open_connections(), 0);
}

/// Broker down for good, with a backoff budget of about three seconds.
fn slow_backoff_config() -> EventConfig {
    fast_config(BrokerKind::TopicQueue)
        .with_connection_retry_count(5)
        .with_retry_base_delay(Duration::from_millis(50))
}

#[test]
fn dispose_interrupts_a_connection_attempt() {
    let (bus, broker) = topic_queue_bus(slow_backoff_config(), HandlerProvider::new());
    let controls = broker.controls();
    controls.set_reachable(false);

    let connecting = {
        let bus = Arc::clone(&bus);
        thread::spawn(move || bus.try_connect())
    };
    assert!(wait_until(|| controls.connect_attempts() >= 1));

    let started = Instant::now();
    bus.dispose();
    let result = connecting.join().unwrap();

    assert!(matches!(result, Err(BusError::Disposed)));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(controls.connect_attempts() <= 2);
}

#[test]
fn dispose_interrupts_subscribe_and_publish_retries() {
    let (bus, broker) = topic_queue_bus(slow_backoff_config(), HandlerProvider::new());
    let controls = broker.controls();
    controls.set_reachable(false);

    let subscribing = {
        let bus = Arc::clone(&bus);
        thread::spawn(move || {
            bus.subscribe::<OrderCreatedIntegrationEvent, Recorder<OrderCreatedIntegrationEvent>>()
        })
    };
    let publishing = {
        let bus = Arc::clone(&bus);
        thread::spawn(move || bus.publish(&OrderStartedIntegrationEvent::new(1, 500)))
    };
    assert!(wait_until(|| controls.connect_attempts() >= 1));

    let started = Instant::now();
    bus.dispose();

    assert!(matches!(subscribing.join().unwrap(), Err(BusError::Disposed)));
    assert!(matches!(publishing.join().unwrap(), Err(BusError::Disposed)));
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
fn dispose_does_not_wait_for_a_reconnecting_consumer() {
    let (bus, broker) = topic_queue_bus(slow_backoff_config(), HandlerProvider::new());
    let controls = broker.controls();
    bus.subscribe::<OrderCreatedIntegrationEvent, Recorder<OrderCreatedIntegrationEvent>>()
        .unwrap();
    assert!(wait_until(|| controls.open_connections() == 1));

    controls.set_reachable(false);
    controls.drop_connections("broker went away");
    let before = controls.connect_attempts();
    assert!(wait_until(|| controls.connect_attempts() > before));

    let started = Instant::now();
    bus.dispose();

    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!bus.is_consuming());
}
