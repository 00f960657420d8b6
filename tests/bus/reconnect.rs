use serde_json::json;
use topic_bus::bus::ExchangeKind;
use topic_bus::{BusConfig, ConnectionState, InMemoryBroker};

use crate::support::{bus, connected, eventually, settle, Recorder, RECONNECT_INTERVAL, TIMEOUT};

#[tokio::test]
async fn subscription_receives_again_after_connection_drop() {
    let broker = InMemoryBroker::new();
    let consumer = connected(&broker, "notification-service").await;
    let recorder = Recorder::new();
    consumer
        .subscribe("user.events", "user.*", "notifications", recorder.handler())
        .await
        .unwrap();
    let producer = connected(&broker, "auth-service").await;

    assert!(producer.publish("user.events", "user.registered", &json!({ "seq": 1 })).await);
    assert!(eventually(|| recorder.count() == 1).await);

    broker.drop_connections();
    // nothing is buffered while the connection is down
    assert!(!producer.publish("user.events", "user.registered", &json!({ "seq": 2 })).await);

    assert!(eventually(|| consumer.stats().connections >= 2 && producer.stats().connections >= 2).await);
    assert!(consumer.wait_connected(TIMEOUT).await);
    assert!(producer.wait_connected(TIMEOUT).await);

    assert!(producer.publish("user.events", "user.registered", &json!({ "seq": 3 })).await);
    assert!(eventually(|| recorder.sequence_numbers().contains(&3)).await);
    settle().await;
    assert_eq!(recorder.sequence_numbers(), vec![1, 3]);
    assert_eq!(broker.consumer_count("notifications"), 1);
}

#[tokio::test]
async fn connect_absorbs_unreachable_broker() {
    let broker = InMemoryBroker::new();
    broker.set_reachable(false);
    let bus = bus(&broker, "svc");
    let recorder = Recorder::new();
    bus.subscribe("X", "#", "q", recorder.handler()).await.unwrap();

    bus.connect().await.unwrap();
    assert_ne!(bus.state(), ConnectionState::Connected);
    assert!(!bus.publish("X", "a.b", &json!({ "seq": 1 })).await);

    broker.set_reachable(true);
    assert!(bus.wait_connected(TIMEOUT).await);
    assert!(bus.publish("X", "a.b", &json!({ "seq": 2 })).await);
    assert!(eventually(|| recorder.count() == 1).await);
    assert_eq!(recorder.sequence_numbers(), vec![2]);
}

#[tokio::test]
async fn declaration_conflict_triggers_reconnect() {
    let broker = InMemoryBroker::new();
    broker.declare_exchange("legacy", ExchangeKind::Fanout, true);
    let bus = connected(&broker, "svc").await;

    assert!(!bus.publish("legacy", "a.b", &json!({})).await);
    assert!(eventually(|| bus.stats().connections >= 2).await);
    assert!(bus.wait_connected(TIMEOUT).await);

    assert!(bus.publish("user.events", "a.b", &json!({})).await);
    assert_eq!(broker.exchange_kind("legacy"), Some(ExchangeKind::Fanout));
}

#[tokio::test]
async fn max_attempts_bounds_retries() {
    let broker = InMemoryBroker::new();
    broker.set_reachable(false);
    let bus = topic_bus::Bus::new(
        BusConfig::in_memory("svc")
            .with_reconnect_interval(RECONNECT_INTERVAL)
            .with_max_reconnect_attempts(2),
        broker.clone(),
    );

    bus.connect().await.unwrap();
    assert!(eventually(|| broker.connect_attempts() == 2).await);
    settle().await;
    settle().await;
    assert_eq!(broker.connect_attempts(), 2);
    assert_eq!(bus.state(), ConnectionState::Disconnected);

    // a later connect starts over
    broker.set_reachable(true);
    bus.connect().await.unwrap();
    assert!(bus.wait_connected(TIMEOUT).await);
}

#[tokio::test]
async fn connected_state_follows_the_connection() {
    let broker = InMemoryBroker::new();
    let bus = connected(&broker, "svc").await;
    assert_eq!(bus.state(), ConnectionState::Connected);

    broker.set_reachable(false);
    broker.drop_connections();
    assert!(eventually(|| bus.state() != ConnectionState::Connected).await);

    broker.set_reachable(true);
    assert!(bus.wait_connected(TIMEOUT).await);
    assert_eq!(broker.open_connections(), 1);
}

#[tokio::test]
async fn cancelled_consumer_is_restored() {
    let broker = InMemoryBroker::new();
    let bus = connected(&broker, "svc").await;
    let recorder = Recorder::new();
    bus.subscribe("X", "#", "q", recorder.handler()).await.unwrap();
    assert_eq!(broker.consumer_count("q"), 1);

    // e.g. the queue failed over to another node
    broker.cancel_consumers("q");

    assert!(eventually(|| bus.stats().connections >= 2).await);
    assert!(bus.wait_connected(TIMEOUT).await);
    assert!(eventually(|| broker.consumer_count("q") == 1).await);

    assert!(bus.publish("X", "a.b", &json!({ "seq": 1 })).await);
    assert!(eventually(|| recorder.count() == 1).await);
}
