use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::json;
use topic_bus::InMemoryBroker;

use crate::support::{always_failing, connected, eventually, settle, Recorder};

#[tokio::test]
async fn failing_handler_sees_each_message_once() {
    let broker = InMemoryBroker::new();
    let bus = connected(&broker, "svc").await;
    let calls = Arc::new(AtomicUsize::new(0));
    bus.subscribe("orders", "#", "poison", always_failing(calls.clone()))
        .await
        .unwrap();

    for seq in 0..5 {
        assert!(bus.publish("orders", "order.created", &json!({ "seq": seq })).await);
    }

    assert!(eventually(|| broker.dead_lettered("poison") == 5).await);
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert_eq!(broker.queue_depth("poison"), 0);

    let stats = bus.stats();
    assert_eq!(stats.failed, 5);
    assert_eq!(stats.handled, 0);
}

#[tokio::test]
async fn failure_is_isolated_to_its_subscription() {
    let broker = InMemoryBroker::new();
    let bus = connected(&broker, "svc").await;
    let calls = Arc::new(AtomicUsize::new(0));
    let healthy = Recorder::new();
    bus.subscribe("orders", "#", "broken", always_failing(calls.clone()))
        .await
        .unwrap();
    bus.subscribe("orders", "#", "healthy", healthy.handler()).await.unwrap();

    assert!(bus.publish("orders", "order.created", &json!({ "seq": 1 })).await);
    assert!(bus.publish("orders", "order.created", &json!({ "seq": 2 })).await);

    assert!(eventually(|| healthy.count() == 2 && broker.dead_lettered("broken") == 2).await);
    assert_eq!(healthy.sequence_numbers(), vec![1, 2]);
    assert_eq!(bus.stats().handled, 2);
    assert_eq!(bus.stats().failed, 2);
    assert_eq!(broker.queue_depth("healthy"), 0);
}
