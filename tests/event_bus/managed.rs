//! The same engine over the managed topic/subscription service.

use std::sync::{Arc, OnceLock};

use integration_bus::broker::managed::DEFAULT_RULE_NAME;
use integration_bus::broker::ServiceBusSession;
use integration_bus::{
    BrokerConnection, BrokerKind, ConnectionSettings, Connector, HandlerProvider, Message,
};

use crate::support::*;

fn subscription(event_name: &str) -> String {
    queue_name(event_name)
}

#[test]
fn subscribing_replaces_the_default_rule() {
    let (bus, service_bus) = managed_bus(fast_config(BrokerKind::Managed), HandlerProvider::new());

    bus.subscribe::<OrderCreatedIntegrationEvent, Recorder<OrderCreatedIntegrationEvent>>()
        .unwrap();

    let name = subscription("OrderCreated");
    assert!(service_bus.has_topic(TOPIC));
    assert!(service_bus.has_subscription(TOPIC, &name));
    let rules = service_bus.rule_names(TOPIC, &name);
    assert_eq!(rules, vec!["OrderCreated"]);
    assert!(!rules.iter().any(|r| r == DEFAULT_RULE_NAME));
}

#[test]
fn order_created_is_handled_exactly_once() {
    let recorder = Recorder::<OrderCreatedIntegrationEvent>::shared();
    let (bus, _service_bus) = managed_bus(
        fast_config(BrokerKind::Managed),
        HandlerProvider::new().singleton(Arc::clone(&recorder)),
    );

    bus.subscribe::<OrderCreatedIntegrationEvent, Recorder<OrderCreatedIntegrationEvent>>()
        .unwrap();
    let event = OrderCreatedIntegrationEvent::new(1, "alice");
    bus.publish(&event).unwrap();

    assert!(wait_until(|| recorder.count() == 1));
    settle();
    assert_eq!(recorder.events(), vec![event]);
    assert_eq!(bus.dispose().handled, 1);
}

#[test]
fn label_rules_keep_events_apart() {
    let created = Recorder::<OrderCreatedIntegrationEvent>::shared();
    let started = Recorder::<OrderStartedIntegrationEvent>::shared();
    let (bus, service_bus) = managed_bus(
        fast_config(BrokerKind::Managed),
        HandlerProvider::new()
            .singleton(Arc::clone(&created))
            .singleton(Arc::clone(&started)),
    );

    bus.subscribe::<OrderCreatedIntegrationEvent, Recorder<OrderCreatedIntegrationEvent>>()
        .unwrap();
    bus.subscribe::<OrderStartedIntegrationEvent, Recorder<OrderStartedIntegrationEvent>>()
        .unwrap();

    bus.publish(&OrderCreatedIntegrationEvent::new(1, "alice")).unwrap();
    bus.publish(&OrderStartedIntegrationEvent::new(1, 2_500)).unwrap();

    assert!(wait_until(|| created.count() == 1 && started.count() == 1));
    settle();
    assert_eq!(created.count(), 1);
    assert_eq!(started.count(), 1);
    assert_eq!(service_bus.message_count(TOPIC, &subscription("OrderCreated")), 0);
    assert_eq!(service_bus.message_count(TOPIC, &subscription("OrderStarted")), 0);
}

#[test]
fn handlers_can_publish_follow_up_events() {
    let slot = Arc::new(OnceLock::new());
    let successes = Recorder::<OrderPaymentSuccessIntegrationEvent>::shared();
    let failures = Recorder::<OrderPaymentFailedIntegrationEvent>::shared();
    let (bus, _service_bus) = managed_bus(
        fast_config(BrokerKind::Managed),
        payment_provider(&slot, &successes, &failures),
    );
    slot.set(Arc::downgrade(&bus)).unwrap();

    bus.subscribe::<OrderPaymentSuccessIntegrationEvent, Recorder<OrderPaymentSuccessIntegrationEvent>>()
        .unwrap();
    bus.subscribe::<OrderPaymentFailedIntegrationEvent, Recorder<OrderPaymentFailedIntegrationEvent>>()
        .unwrap();
    bus.subscribe::<OrderStartedIntegrationEvent, PaymentHandler>().unwrap();

    bus.publish(&OrderStartedIntegrationEvent::new(20, PAYMENT_LIMIT_CENTS)).unwrap();
    bus.publish(&OrderStartedIntegrationEvent::new(21, PAYMENT_LIMIT_CENTS + 1)).unwrap();

    assert!(wait_until(|| successes.count() == 1 && failures.count() == 1));
    assert_eq!(successes.events()[0].order_id, 20);
    assert_eq!(failures.events()[0].order_id, 21);
}

#[test]
fn unsubscribing_deletes_the_subscription() {
    let (bus, service_bus) = managed_bus(fast_config(BrokerKind::Managed), HandlerProvider::new());
    let name = subscription("OrderCreated");

    bus.subscribe::<OrderCreatedIntegrationEvent, Recorder<OrderCreatedIntegrationEvent>>()
        .unwrap();
    assert!(service_bus.has_subscription(TOPIC, &name));

    assert!(bus
        .unsubscribe::<OrderCreatedIntegrationEvent, Recorder<OrderCreatedIntegrationEvent>>()
        .unwrap());
    assert!(!service_bus.has_subscription(TOPIC, &name));
    assert!(bus.registry().is_empty());
}

#[test]
fn concurrent_subscribe_and_unsubscribe_keep_the_subscription() {
    let recorder = Recorder::<OrderCreatedIntegrationEvent>::shared();
    let (bus, service_bus) = managed_bus(
        fast_config(BrokerKind::Managed),
        HandlerProvider::new()
            .singleton(Arc::clone(&recorder))
            .transient(|| FailingHandler),
    );
    bus.try_connect().unwrap();

    churn_order_created_handlers(&bus, 200);

    let name = subscription("OrderCreated");
    assert_eq!(bus.registry().handlers_for::<OrderCreatedIntegrationEvent>().len(), 1);
    assert!(service_bus.has_subscription(TOPIC, &name));
    assert_eq!(service_bus.rule_names(TOPIC, &name), vec!["OrderCreated"]);
}

#[test]
fn undecodable_messages_are_dead_lettered() {
    let recorder = Recorder::<OrderCreatedIntegrationEvent>::shared();
    let (bus, service_bus) = managed_bus(
        fast_config(BrokerKind::Managed),
        HandlerProvider::new().singleton(Arc::clone(&recorder)),
    );
    bus.subscribe::<OrderCreatedIntegrationEvent, Recorder<OrderCreatedIntegrationEvent>>()
        .unwrap();

    let connection = service_bus.connect(&ConnectionSettings::default()).unwrap();
    let mut session = connection.create_channel().unwrap();
    let garbage = Message::new("bad-1", "OrderCreated", "application/json", b"{\"id\":".to_vec());
    session.send(TOPIC, &garbage).unwrap();
    bus.publish(&OrderCreatedIntegrationEvent::new(9, "erin")).unwrap();

    assert!(wait_until(|| recorder.count() == 1));
    assert!(wait_until(|| service_bus.controls().dead_letters().len() == 1));
    let (from, message) = service_bus.controls().dead_letters().remove(0);
    assert!(from.ends_with(&subscription("OrderCreated")));
    assert_eq!(message.id, "bad-1");
    assert_eq!(bus.dispose().dropped, 1);
}

#[test]
fn subscriptions_survive_a_dropped_connection() {
    let recorder = Recorder::<OrderCreatedIntegrationEvent>::shared();
    let (bus, service_bus) = managed_bus(
        fast_config(BrokerKind::Managed),
        HandlerProvider::new().singleton(Arc::clone(&recorder)),
    );

    bus.subscribe::<OrderCreatedIntegrationEvent, Recorder<OrderCreatedIntegrationEvent>>()
        .unwrap();
    service_bus.controls().drop_connections("namespace failover");
    assert!(wait_until(|| bus.is_connected()));

    bus.publish(&OrderCreatedIntegrationEvent::new(1, "alice")).unwrap();
    assert!(wait_until(|| recorder.count() == 1));
}
