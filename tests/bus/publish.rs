use std::collections::HashMap;

use serde_json::json;
use topic_bus::bus::ExchangeKind;
use topic_bus::{InMemoryBroker, PublishError, PublishOptions};

use crate::support::{bus, connected};

#[tokio::test]
async fn publish_without_channel_returns_false_and_does_not_retry() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker, "svc");

    assert!(!bus.publish("user.events", "user.registered", &json!({})).await);

    // connecting later does not resend it
    bus.connect().await.unwrap();
    assert!(broker.published().is_empty());
    assert_eq!(bus.stats().dropped, 1);
    assert_eq!(bus.stats().published, 0);
}

#[tokio::test]
async fn published_messages_are_persistent_on_a_durable_topic_exchange() {
    let broker = InMemoryBroker::new();
    let bus = connected(&broker, "svc").await;

    assert!(bus.publish("user.events", "user.registered", &json!({ "type": "user.registered" })).await);

    let published = broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].exchange, "user.events");
    assert_eq!(published[0].routing_key, "user.registered");
    assert!(published[0].persistent);
    assert_eq!(broker.exchange_kind("user.events"), Some(ExchangeKind::Topic));
    assert_eq!(bus.stats().published, 1);
}

#[tokio::test]
async fn try_publish_reports_the_reason() {
    let broker = InMemoryBroker::new();
    let bus = connected(&broker, "svc").await;
    let options = PublishOptions::default();

    assert!(matches!(
        bus.try_publish("", "a.b", &json!({}), &options).await,
        Err(PublishError::InvalidTarget(_))
    ));
    assert!(matches!(
        bus.try_publish("user.events", "a.*", &json!({}), &options).await,
        Err(PublishError::InvalidTarget(_))
    ));

    // JSON object keys must be strings
    let mut unserializable = HashMap::new();
    unserializable.insert((1u8, 2u8), "value");
    assert!(matches!(
        bus.try_publish("user.events", "a.b", &unserializable, &options).await,
        Err(PublishError::Serialization(_))
    ));

    broker.declare_exchange("legacy", ExchangeKind::Direct, true);
    assert!(matches!(
        bus.try_publish("legacy", "a.b", &json!({}), &options).await,
        Err(PublishError::Declaration(_))
    ));

    assert!(broker.published().is_empty());
    assert_eq!(bus.stats().dropped, 4);
}

#[tokio::test]
async fn try_publish_right_after_connection_loss_is_not_connected() {
    let broker = InMemoryBroker::new();
    let bus = connected(&broker, "svc").await;

    broker.drop_connections();

    assert!(matches!(
        bus.try_publish("user.events", "a.b", &json!({}), &PublishOptions::default()).await,
        Err(PublishError::NotConnected)
    ));
    assert!(broker.published().is_empty());
    assert_eq!(bus.stats().dropped, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_publishes_keep_their_own_metadata() {
    let broker = InMemoryBroker::new();
    let bus = connected(&broker, "svc").await;

    let tasks: Vec<_> = (0..32)
        .map(|seq| {
            let bus = bus.clone();
            tokio::spawn(async move {
                let options = PublishOptions::new().request_id(format!("req-{}", seq));
                bus.publish_with("load", "load.test", &json!({ "seq": seq }), &options)
                    .await
            })
        })
        .collect();
    for task in tasks {
        assert!(task.await.unwrap());
    }

    let published = broker.published();
    assert_eq!(published.len(), 32);
    for message in published {
        let body = message.json().unwrap();
        let seq = body["seq"].as_u64().unwrap();
        assert_eq!(body["_metadata"]["requestId"], format!("req-{}", seq));
        assert_eq!(body["_metadata"]["service"], "svc");
    }
    assert_eq!(bus.stats().published, 32);
}
