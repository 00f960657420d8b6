use serde_json::json;
use topic_bus::{BusError, ConnectionState, InMemoryBroker};

use crate::support::{bus, connected, eventually, settle, Recorder};

#[tokio::test]
async fn close_releases_channel_and_connection() {
    let broker = InMemoryBroker::new();
    let bus = connected(&broker, "svc").await;
    let recorder = Recorder::new();
    bus.subscribe("X", "#", "q", recorder.handler()).await.unwrap();
    assert_eq!(broker.open_connections(), 1);
    assert_eq!(broker.consumer_count("q"), 1);

    bus.close().await.unwrap();

    assert_eq!(broker.open_connections(), 0);
    assert_eq!(broker.open_channels(), 0);
    assert_eq!(broker.consumer_count("q"), 0);
    assert_eq!(bus.state(), ConnectionState::Closing);
}

#[tokio::test]
async fn operations_after_close_report_not_connected() {
    let broker = InMemoryBroker::new();
    let bus = connected(&broker, "svc").await;
    bus.close().await.unwrap();

    assert!(!bus.publish("X", "a.b", &json!({})).await);
    let recorder = Recorder::new();
    assert!(matches!(
        bus.subscribe("X", "#", "q", recorder.handler()).await,
        Err(BusError::NotConnected)
    ));
    assert!(matches!(bus.connect().await, Err(BusError::NotConnected)));
    assert!(broker.published().is_empty());
}

#[tokio::test]
async fn connection_is_released_even_when_channel_release_fails() {
    let broker = InMemoryBroker::new();
    let bus = connected(&broker, "svc").await;
    broker.fail_channel_close(true);

    let result = bus.close().await;

    assert!(matches!(result, Err(BusError::Close(_))));
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test]
async fn close_cancels_pending_reconnect() {
    let broker = InMemoryBroker::new();
    broker.set_reachable(false);
    let bus = bus(&broker, "svc");
    bus.connect().await.unwrap();

    bus.close().await.unwrap();
    let attempts = broker.connect_attempts();
    broker.set_reachable(true);
    settle().await;

    assert_eq!(broker.connect_attempts(), attempts);
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test]
async fn close_before_connect_is_fine() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker, "svc");

    bus.close().await.unwrap();
    assert_eq!(broker.connect_attempts(), 0);
}

#[tokio::test]
async fn dropped_bus_stops_competing_for_its_queue() {
    let broker = InMemoryBroker::new();
    let dropped = connected(&broker, "worker-1").await;
    let dropped_recorder = Recorder::new();
    dropped
        .subscribe("jobs", "#", "workers", dropped_recorder.handler())
        .await
        .unwrap();
    let survivor = connected(&broker, "worker-2").await;
    let survivor_recorder = Recorder::new();
    survivor
        .subscribe("jobs", "#", "workers", survivor_recorder.handler())
        .await
        .unwrap();
    assert_eq!(broker.consumer_count("workers"), 2);

    drop(dropped);
    assert!(eventually(|| broker.open_connections() == 1 && broker.consumer_count("workers") == 1).await);

    for seq in 0..4 {
        assert!(survivor.publish("jobs", "job.created", &json!({ "seq": seq })).await);
    }
    assert!(eventually(|| survivor_recorder.count() == 4).await);
    settle().await;
    assert_eq!(dropped_recorder.count(), 0);
}
