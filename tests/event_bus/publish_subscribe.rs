//! Publish/subscribe over the exchange/queue broker.

use std::sync::{Arc, OnceLock};

use integration_bus::broker::AmqpChannel;
use integration_bus::{
    BrokerConnection, BrokerKind, BusError, ConnectionSettings, Connector, HandlerProvider,
    Message, RegistryError, Serializer,
};

use crate::support::*;

#[test]
fn order_created_is_handled_exactly_once() {
    let recorder = Recorder::<OrderCreatedIntegrationEvent>::shared();
    let (bus, _broker) = topic_queue_bus(
        fast_config(BrokerKind::TopicQueue),
        HandlerProvider::new().singleton(Arc::clone(&recorder)),
    );

    bus.subscribe::<OrderCreatedIntegrationEvent, Recorder<OrderCreatedIntegrationEvent>>()
        .unwrap();
    let event = OrderCreatedIntegrationEvent::new(1, "alice");
    bus.publish(&event).unwrap();

    assert!(wait_until(|| recorder.count() == 1));
    settle();
    assert_eq!(recorder.events(), vec![event]);

    let stats = bus.dispose();
    assert_eq!(stats.handled, 1);
    assert_eq!(stats.dropped, 0);
    assert_eq!(stats.ack_failures, 0);
}

#[test]
fn publish_declares_topology() {
    let (bus, broker) = topic_queue_bus(fast_config(BrokerKind::TopicQueue), HandlerProvider::new());

    bus.publish(&OrderCreatedIntegrationEvent::new(1, "alice")).unwrap();

    let queue = queue_name("OrderCreated");
    assert!(broker.has_exchange(TOPIC));
    assert_eq!(broker.routing_keys(&queue), vec!["OrderCreated"]);
    assert_eq!(broker.message_count(&queue), 1);
}

#[test]
fn events_published_before_subscribing_are_delivered() {
    let recorder = Recorder::<OrderCreatedIntegrationEvent>::shared();
    let (bus, _broker) = topic_queue_bus(
        fast_config(BrokerKind::TopicQueue),
        HandlerProvider::new().singleton(Arc::clone(&recorder)),
    );

    bus.publish(&OrderCreatedIntegrationEvent::new(7, "bob")).unwrap();
    bus.subscribe::<OrderCreatedIntegrationEvent, Recorder<OrderCreatedIntegrationEvent>>()
        .unwrap();

    assert!(wait_until(|| recorder.count() == 1));
    assert_eq!(recorder.events()[0].id, 7);
}

#[test]
fn handler_failures_do_not_affect_siblings() {
    let recorder = Recorder::<OrderCreatedIntegrationEvent>::shared();
    let provider = HandlerProvider::new()
        .transient(|| FailingHandler)
        .transient(|| PanickingHandler)
        .singleton(Arc::clone(&recorder));
    let (bus, _broker) = topic_queue_bus(fast_config(BrokerKind::TopicQueue), provider);

    bus.subscribe::<OrderCreatedIntegrationEvent, FailingHandler>().unwrap();
    bus.subscribe::<OrderCreatedIntegrationEvent, PanickingHandler>().unwrap();
    bus.subscribe::<OrderCreatedIntegrationEvent, Recorder<OrderCreatedIntegrationEvent>>()
        .unwrap();

    bus.publish(&OrderCreatedIntegrationEvent::new(1, "alice")).unwrap();
    bus.publish(&OrderCreatedIntegrationEvent::new(2, "bob")).unwrap();

    assert!(wait_until(|| recorder.count() == 2));
    settle();
    let ids: Vec<u64> = recorder.events().iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![1, 2]);

    let stats = bus.dispose();
    assert_eq!(stats.handled, 2);
    assert_eq!(stats.handler_failures, 4);
}

#[test]
fn unresolvable_handler_is_reported_not_fatal() {
    let recorder = Recorder::<OrderCreatedIntegrationEvent>::shared();
    // FailingHandler is subscribed but the provider cannot build it.
    let (bus, _broker) = topic_queue_bus(
        fast_config(BrokerKind::TopicQueue),
        HandlerProvider::new().singleton(Arc::clone(&recorder)),
    );

    bus.subscribe::<OrderCreatedIntegrationEvent, FailingHandler>().unwrap();
    bus.subscribe::<OrderCreatedIntegrationEvent, Recorder<OrderCreatedIntegrationEvent>>()
        .unwrap();
    bus.publish(&OrderCreatedIntegrationEvent::new(3, "carol")).unwrap();

    assert!(wait_until(|| recorder.count() == 1));
    let stats = bus.dispose();
    assert_eq!(stats.handler_failures, 1);
}

#[test]
fn handlers_can_publish_follow_up_events() {
    let slot = Arc::new(OnceLock::new());
    let successes = Recorder::<OrderPaymentSuccessIntegrationEvent>::shared();
    let failures = Recorder::<OrderPaymentFailedIntegrationEvent>::shared();
    let (bus, _broker) = topic_queue_bus(
        fast_config(BrokerKind::TopicQueue),
        payment_provider(&slot, &successes, &failures),
    );
    slot.set(Arc::downgrade(&bus)).unwrap();

    bus.subscribe::<OrderStartedIntegrationEvent, PaymentHandler>().unwrap();
    bus.subscribe::<OrderPaymentSuccessIntegrationEvent, Recorder<OrderPaymentSuccessIntegrationEvent>>()
        .unwrap();
    bus.subscribe::<OrderPaymentFailedIntegrationEvent, Recorder<OrderPaymentFailedIntegrationEvent>>()
        .unwrap();

    bus.publish(&OrderStartedIntegrationEvent::new(10, 5_000)).unwrap();
    bus.publish(&OrderStartedIntegrationEvent::new(11, 50_000)).unwrap();

    assert!(wait_until(|| successes.count() == 1 && failures.count() == 1));
    assert_eq!(successes.events()[0].order_id, 10);
    assert_eq!(failures.events()[0].order_id, 11);
    assert_eq!(failures.events()[0].reason, "limit exceeded");
}

#[test]
fn duplicate_subscribe_is_a_no_op() {
    let recorder = Recorder::<OrderCreatedIntegrationEvent>::shared();
    let (bus, _broker) = topic_queue_bus(
        fast_config(BrokerKind::TopicQueue),
        HandlerProvider::new().singleton(Arc::clone(&recorder)),
    );

    bus.subscribe::<OrderCreatedIntegrationEvent, Recorder<OrderCreatedIntegrationEvent>>()
        .unwrap();
    bus.subscribe::<OrderCreatedIntegrationEvent, Recorder<OrderCreatedIntegrationEvent>>()
        .unwrap();
    assert_eq!(
        bus.registry()
            .handlers_for::<OrderCreatedIntegrationEvent>()
            .len(),
        1
    );

    bus.publish(&OrderCreatedIntegrationEvent::new(1, "alice")).unwrap();
    assert!(wait_until(|| recorder.count() == 1));
    settle();
    assert_eq!(recorder.count(), 1);
}

#[test]
fn conflicting_event_names_are_rejected() {
    let (bus, _broker) = topic_queue_bus(fast_config(BrokerKind::TopicQueue), HandlerProvider::new());

    bus.subscribe::<OrderCreatedIntegrationEvent, Recorder<OrderCreatedIntegrationEvent>>()
        .unwrap();
    let err = bus
        .subscribe::<LegacyOrderCreated, Recorder<LegacyOrderCreated>>()
        .unwrap_err();

    assert!(matches!(
        err,
        BusError::Registry(RegistryError::EventNameCollision { ref event_name, .. })
            if event_name == "OrderCreated"
    ));
}

#[test]
fn unsubscribing_the_last_handler_unbinds_the_queue() {
    let recorder = Recorder::<OrderCreatedIntegrationEvent>::shared();
    let (bus, broker) = topic_queue_bus(
        fast_config(BrokerKind::TopicQueue),
        HandlerProvider::new().singleton(Arc::clone(&recorder)),
    );
    let queue = queue_name("OrderCreated");

    bus.subscribe::<OrderCreatedIntegrationEvent, Recorder<OrderCreatedIntegrationEvent>>()
        .unwrap();
    assert_eq!(broker.routing_keys(&queue), vec!["OrderCreated"]);

    assert!(bus
        .unsubscribe::<OrderCreatedIntegrationEvent, Recorder<OrderCreatedIntegrationEvent>>()
        .unwrap());
    assert!(broker.routing_keys(&queue).is_empty());
    assert!(bus.registry().is_empty());
    assert!(bus.is_consuming());

    assert!(!bus
        .unsubscribe::<OrderCreatedIntegrationEvent, Recorder<OrderCreatedIntegrationEvent>>()
        .unwrap());

    bus.publish(&OrderCreatedIntegrationEvent::new(1, "alice")).unwrap();
    settle();
    assert_eq!(recorder.count(), 0);
}

#[test]
fn concurrent_subscribe_and_unsubscribe_keep_the_binding() {
    let recorder = Recorder::<OrderCreatedIntegrationEvent>::shared();
    let (bus, broker) = topic_queue_bus(
        fast_config(BrokerKind::TopicQueue),
        HandlerProvider::new()
            .singleton(Arc::clone(&recorder))
            .transient(|| FailingHandler),
    );
    bus.try_connect().unwrap();

    churn_order_created_handlers(&bus, 200);

    assert!(bus.registry().has_subscriptions_for::<OrderCreatedIntegrationEvent>());
    assert_eq!(bus.registry().handlers_for::<OrderCreatedIntegrationEvent>().len(), 1);
    assert_eq!(broker.routing_keys(&queue_name("OrderCreated")), vec!["OrderCreated"]);
}

#[test]
fn unknown_and_undecodable_messages_are_dropped() {
    let recorder = Recorder::<OrderCreatedIntegrationEvent>::shared();
    let (bus, broker) = topic_queue_bus(
        fast_config(BrokerKind::TopicQueue),
        HandlerProvider::new().singleton(Arc::clone(&recorder)),
    );
    bus.subscribe::<OrderCreatedIntegrationEvent, Recorder<OrderCreatedIntegrationEvent>>()
        .unwrap();

    // A foreign producer writing straight into the bound queue.
    let connection = broker.connect(&ConnectionSettings::default()).unwrap();
    let mut channel = connection.create_channel().unwrap();
    let stray = Message::new("stray-1", "ShipmentDispatched", "application/json", b"{}".to_vec());
    let garbage = Message::new("bad-1", "OrderCreated", "application/json", b"not json".to_vec());
    channel.basic_publish(TOPIC, "OrderCreated", &stray, true).unwrap();
    channel.basic_publish(TOPIC, "OrderCreated", &garbage, true).unwrap();

    bus.publish(&OrderCreatedIntegrationEvent::new(1, "alice")).unwrap();

    assert!(wait_until(|| recorder.count() == 1));
    assert!(wait_until(|| broker.controls().dead_letters().len() == 2));
    let stats = bus.dispose();
    assert_eq!(stats.dropped, 2);
    assert_eq!(stats.handled, 1);

    let dead: Vec<String> = broker
        .controls()
        .dead_letters()
        .into_iter()
        .map(|(_, m)| m.id)
        .collect();
    assert_eq!(dead, vec!["stray-1", "bad-1"]);
}

#[test]
fn bitcode_payloads_round_trip() {
    let recorder = Recorder::<OrderStartedIntegrationEvent>::shared();
    let (bus, broker) = topic_queue_bus(
        fast_config(BrokerKind::TopicQueue).with_serializer(Serializer::Bitcode),
        HandlerProvider::new().singleton(Arc::clone(&recorder)),
    );

    let event = OrderStartedIntegrationEvent::new(5, 1_999);
    bus.publish(&event).unwrap();
    assert_eq!(broker.message_count(&queue_name("OrderStarted")), 1);

    bus.subscribe::<OrderStartedIntegrationEvent, Recorder<OrderStartedIntegrationEvent>>()
        .unwrap();
    assert!(wait_until(|| recorder.count() == 1));
    assert_eq!(recorder.events(), vec![event]);
}

#[test]
fn affixes_are_stripped_from_wire_names() {
    let recorder = Recorder::<OrderStartedIntegrationEvent>::shared();
    let (bus, broker) = topic_queue_bus(
        fast_config(BrokerKind::TopicQueue).with_event_name_prefix("Order"),
        HandlerProvider::new().singleton(Arc::clone(&recorder)),
    );

    bus.subscribe::<OrderStartedIntegrationEvent, Recorder<OrderStartedIntegrationEvent>>()
        .unwrap();
    assert_eq!(broker.routing_keys(&queue_name("Started")), vec!["Started"]);

    bus.publish(&OrderStartedIntegrationEvent::new(1, 100)).unwrap();
    assert!(wait_until(|| recorder.count() == 1));
}
