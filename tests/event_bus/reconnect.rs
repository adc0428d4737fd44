//! Connection loss, retries and redelivery.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use integration_bus::{BrokerKind, BusError, ConnectionState, HandlerProvider};

use crate::support::*;

#[test]
fn connects_after_three_refusals_in_four_attempts() {
    let (bus, broker) = topic_queue_bus(
        fast_config(BrokerKind::TopicQueue).with_connection_retry_count(5),
        HandlerProvider::new(),
    );
    let controls = broker.controls();
    controls.refuse_connections(3);

    assert!(bus.try_connect().unwrap());

    assert_eq!(controls.connect_attempts(), 4);
    assert!(bus.is_connected());
    assert_eq!(bus.state(), ConnectionState::Connected);
}

#[test]
fn publish_fails_when_the_broker_stays_down() {
    let (bus, broker) = topic_queue_bus(
        fast_config(BrokerKind::TopicQueue).with_connection_retry_count(5),
        HandlerProvider::new(),
    );
    let controls = broker.controls();
    controls.set_reachable(false);

    let err = bus
        .publish(&OrderCreatedIntegrationEvent::new(1, "alice"))
        .unwrap_err();

    assert!(matches!(
        err,
        BusError::ConnectionUnavailable {
            kind: BrokerKind::TopicQueue
        }
    ));
    assert_eq!(controls.connect_attempts(), 6);
    assert!(!bus.is_connected());
    assert_eq!(bus.state(), ConnectionState::Disconnected);
}

#[test]
fn transient_send_failures_are_retried() {
    let (bus, broker) = topic_queue_bus(fast_config(BrokerKind::TopicQueue), HandlerProvider::new());
    let controls = broker.controls();
    controls.fail_publishes(2);

    bus.publish(&OrderCreatedIntegrationEvent::new(1, "alice")).unwrap();

    assert_eq!(controls.published(), 1);
    assert_eq!(broker.message_count(&queue_name("OrderCreated")), 1);
}

#[test]
fn publish_gives_up_after_the_retry_budget() {
    let (bus, broker) = topic_queue_bus(
        fast_config(BrokerKind::TopicQueue).with_connection_retry_count(2),
        HandlerProvider::new(),
    );
    let controls = broker.controls();
    assert!(bus.try_connect().unwrap());
    controls.fail_publishes(10);

    let err = bus
        .publish(&OrderCreatedIntegrationEvent::new(1, "alice"))
        .unwrap_err();

    match err {
        BusError::PublishFailed {
            event_name,
            attempts,
            source,
        } => {
            assert_eq!(event_name, "OrderCreated");
            assert_eq!(attempts, 3);
            assert!(source.is_transient());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(controls.published(), 0);
}

#[test]
fn subscriptions_survive_a_dropped_connection() {
    let recorder = Recorder::<OrderCreatedIntegrationEvent>::shared();
    let (bus, broker) = topic_queue_bus(
        fast_config(BrokerKind::TopicQueue),
        HandlerProvider::new().singleton(Arc::clone(&recorder)),
    );
    let controls = broker.controls();

    bus.subscribe::<OrderCreatedIntegrationEvent, Recorder<OrderCreatedIntegrationEvent>>()
        .unwrap();
    bus.publish(&OrderCreatedIntegrationEvent::new(1, "alice")).unwrap();
    assert!(wait_until(|| recorder.count() == 1));

    controls.drop_connections("node restarted");
    assert!(wait_until(|| bus.is_connected()));

    bus.publish(&OrderCreatedIntegrationEvent::new(2, "bob")).unwrap();
    assert!(wait_until(|| recorder.count() == 2));
    assert!(controls.connect_attempts() >= 2);
    assert_eq!(controls.open_connections(), 1);
}

#[test]
fn consumer_recovers_once_the_broker_is_back() {
    let recorder = Recorder::<OrderCreatedIntegrationEvent>::shared();
    let (bus, broker) = topic_queue_bus(
        fast_config(BrokerKind::TopicQueue).with_connection_retry_count(2),
        HandlerProvider::new().singleton(Arc::clone(&recorder)),
    );
    let controls = broker.controls();

    bus.subscribe::<OrderCreatedIntegrationEvent, Recorder<OrderCreatedIntegrationEvent>>()
        .unwrap();

    controls.set_reachable(false);
    controls.drop_connections("power cut");
    thread::sleep(Duration::from_millis(50));
    assert!(!bus.is_connected());

    controls.set_reachable(true);
    assert!(wait_until(|| bus.is_connected()));

    bus.publish(&OrderCreatedIntegrationEvent::new(3, "carol")).unwrap();
    assert!(wait_until(|| recorder.count() == 1));
}

#[test]
fn failed_ack_leads_to_redelivery() {
    let recorder = Recorder::<OrderCreatedIntegrationEvent>::shared();
    let (bus, broker) = topic_queue_bus(
        fast_config(BrokerKind::TopicQueue),
        HandlerProvider::new().singleton(Arc::clone(&recorder)),
    );
    let controls = broker.controls();

    bus.subscribe::<OrderCreatedIntegrationEvent, Recorder<OrderCreatedIntegrationEvent>>()
        .unwrap();
    controls.fail_acks(1);
    let event = OrderCreatedIntegrationEvent::new(1, "alice");
    bus.publish(&event).unwrap();

    assert!(wait_until(|| recorder.count() == 2));
    settle();
    assert_eq!(recorder.events(), vec![event.clone(), event]);
    assert_eq!(controls.unacked(), 0);

    let stats = bus.dispose();
    assert_eq!(stats.handled, 2);
    assert_eq!(stats.ack_failures, 1);
}

#[test]
fn broker_notifications_leave_the_bus_usable() {
    let recorder = Recorder::<OrderCreatedIntegrationEvent>::shared();
    let (bus, broker) = topic_queue_bus(
        fast_config(BrokerKind::TopicQueue),
        HandlerProvider::new().singleton(Arc::clone(&recorder)),
    );
    let controls = broker.controls();
    bus.subscribe::<OrderCreatedIntegrationEvent, Recorder<OrderCreatedIntegrationEvent>>()
        .unwrap();

    controls.block_connections("memory alarm");
    controls.raise_callback_exception("consumer callback failed");
    settle();

    assert!(bus.is_connected());
    bus.publish(&OrderCreatedIntegrationEvent::new(4, "dave")).unwrap();
    assert!(wait_until(|| recorder.count() == 1));
}
