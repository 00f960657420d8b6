use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::json;
use topic_bus::bus::ExchangeKind;
use topic_bus::{AckMode, BusError, InMemoryBroker, Subscription};

use crate::support::{always_failing, bus, connected, eventually, settle, Recorder};

#[tokio::test]
async fn subscriptions_before_connect_are_applied_on_connect() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker, "svc");
    let recorder = Recorder::new();
    bus.subscribe("X", "a.*", "q", recorder.handler()).await.unwrap();
    assert_eq!(broker.consumer_count("q"), 0);

    bus.connect().await.unwrap();
    assert_eq!(broker.consumer_count("q"), 1);
    assert!(broker.is_durable_queue("q"));

    assert!(bus.publish("X", "a.b", &json!({ "seq": 1 })).await);
    assert!(eventually(|| recorder.count() == 1).await);
}

#[tokio::test]
async fn replay_follows_registration_order() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker, "svc");
    for queue in ["first", "second", "third"] {
        bus.subscribe("X", "#", queue, Recorder::new().handler()).await.unwrap();
    }

    bus.connect().await.unwrap();
    assert_eq!(broker.queue_declarations(), vec!["first", "second", "third"]);

    broker.drop_connections();
    assert!(eventually(|| bus.stats().connections >= 2).await);
    assert_eq!(
        broker.queue_declarations(),
        vec!["first", "second", "third", "first", "second", "third"]
    );
}

#[tokio::test]
async fn subscribing_twice_does_not_duplicate_delivery() {
    let broker = InMemoryBroker::new();
    let bus = connected(&broker, "svc").await;
    let recorder = Recorder::new();
    bus.subscribe("X", "#", "q", recorder.handler()).await.unwrap();
    bus.subscribe("X", "#", "q", recorder.handler()).await.unwrap();
    assert_eq!(broker.consumer_count("q"), 1);
    assert_eq!(broker.binding_count("q"), 1);

    assert!(bus.publish("X", "a.b", &json!({})).await);
    assert!(eventually(|| recorder.count() == 1).await);
    settle().await;
    assert_eq!(recorder.count(), 1);
}

#[tokio::test]
async fn malformed_subscriptions_are_rejected() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker, "svc");
    let recorder = Recorder::new();

    for (exchange, pattern, queue) in [("", "#", "q"), ("X", "#", ""), ("X", "a.b*", "q"), ("X", "", "q")] {
        let result = bus.subscribe(exchange, pattern, queue, recorder.handler()).await;
        assert!(
            matches!(result, Err(BusError::InvalidSubscription(_))),
            "({:?}, {:?}, {:?}) accepted",
            exchange,
            pattern,
            queue
        );
    }
}

#[tokio::test]
async fn declaration_failure_keeps_subscription_and_reconnects() {
    let broker = InMemoryBroker::new();
    broker.declare_exchange("legacy", ExchangeKind::Fanout, true);
    let bus = connected(&broker, "svc").await;

    let recorder = Recorder::new();
    bus.subscribe("legacy", "#", "q", recorder.handler()).await.unwrap();

    // every replay hits the same conflict, so the supervisor keeps retrying
    assert!(eventually(|| broker.connect_attempts() >= 3).await);
    assert_eq!(broker.consumer_count("q"), 0);
    bus.close().await.unwrap();
}

#[tokio::test]
async fn auto_ack_subscription_does_not_dead_letter() {
    let broker = InMemoryBroker::new();
    let bus = connected(&broker, "svc").await;
    let calls = Arc::new(AtomicUsize::new(0));
    bus.subscribe_with(
        Subscription::new("X", "#", "auto", always_failing(calls.clone())).with_ack_mode(AckMode::Auto),
    )
    .await
    .unwrap();

    assert!(bus.publish("X", "a.b", &json!({})).await);
    assert!(eventually(|| calls.load(Ordering::SeqCst) == 1).await);
    settle().await;

    assert_eq!(broker.queue_depth("auto"), 0);
    assert_eq!(broker.dead_lettered("auto"), 0);
    assert_eq!(bus.stats().failed, 1);
    // nothing settled the delivery a second time, so the channel survived
    assert_eq!(bus.stats().connections, 1);
    assert_eq!(broker.consumer_count("auto"), 1);
}

#[tokio::test]
async fn auto_ack_subscription_keeps_consuming() {
    let broker = InMemoryBroker::new();
    let bus = connected(&broker, "svc").await;
    let recorder = Recorder::new();
    bus.subscribe_with(Subscription::new("X", "#", "auto", recorder.handler()).with_ack_mode(AckMode::Auto))
        .await
        .unwrap();

    for seq in 1..=3 {
        assert!(bus.publish("X", "a.b", &json!({ "seq": seq })).await);
    }
    assert!(eventually(|| recorder.count() == 3).await);

    assert_eq!(recorder.sequence_numbers(), vec![1, 2, 3]);
    assert_eq!(bus.stats().handled, 3);
    assert_eq!(bus.stats().connections, 1);
}
