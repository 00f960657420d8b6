use std::collections::BTreeSet;

use serde_json::json;
use topic_bus::InMemoryBroker;

use crate::support::{connected, eventually, settle, Recorder};

const N: u64 = 20;

#[tokio::test]
async fn same_queue_splits_the_stream_without_duplicates() {
    let broker = InMemoryBroker::new();
    let first_instance = connected(&broker, "worker").await;
    let second_instance = connected(&broker, "worker").await;
    let first = Recorder::new();
    let second = Recorder::new();
    first_instance.subscribe("jobs", "job.*", "worker-jobs", first.handler()).await.unwrap();
    second_instance.subscribe("jobs", "job.*", "worker-jobs", second.handler()).await.unwrap();
    assert_eq!(broker.consumer_count("worker-jobs"), 2);

    let producer = connected(&broker, "scheduler").await;
    for seq in 0..N {
        assert!(producer.publish("jobs", "job.created", &json!({ "seq": seq })).await);
    }

    assert!(eventually(|| first.count() + second.count() == N as usize).await);
    settle().await;

    let mut seen = first.sequence_numbers();
    seen.extend(second.sequence_numbers());
    let unique: BTreeSet<u64> = seen.iter().copied().collect();
    assert_eq!(seen.len(), N as usize);
    assert_eq!(unique, (0..N).collect());
    assert!(first.count() > 0 && second.count() > 0);
}

#[tokio::test]
async fn distinct_queues_each_get_every_message() {
    let broker = InMemoryBroker::new();
    let email = connected(&broker, "email-service").await;
    let analytics = connected(&broker, "analytics-service").await;
    let emails = Recorder::new();
    let events = Recorder::new();
    email.subscribe("jobs", "job.*", "email-jobs", emails.handler()).await.unwrap();
    analytics.subscribe("jobs", "job.*", "analytics-jobs", events.handler()).await.unwrap();

    let producer = connected(&broker, "scheduler").await;
    for seq in 0..N {
        assert!(producer.publish("jobs", "job.created", &json!({ "seq": seq })).await);
    }

    assert!(eventually(|| emails.count() == N as usize && events.count() == N as usize).await);
    assert_eq!(emails.sequence_numbers(), (0..N).collect::<Vec<_>>());
    assert_eq!(events.sequence_numbers(), (0..N).collect::<Vec<_>>());
}
