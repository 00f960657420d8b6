use serde_json::json;
use topic_bus::audit::FALLBACK_EVENT_TYPE;
use topic_bus::{AuditHandler, InMemoryAuditSink, InMemoryBroker, PublishOptions};

use crate::support::{connected, eventually};

#[tokio::test]
async fn audit_consumer_records_everything_on_the_exchange() {
    let broker = InMemoryBroker::new();
    let audit = connected(&broker, "audit-log-service").await;
    let documents = InMemoryAuditSink::new("documents");
    let search = InMemoryAuditSink::new("search");
    audit
        .subscribe(
            "user.events",
            "#",
            "audit-log-queue",
            AuditHandler::default()
                .with_sink(documents.clone())
                .with_sink(search.clone()),
        )
        .await
        .unwrap();

    let auth = connected(&broker, "auth-service").await;
    let options = PublishOptions::new().user_id("u-1");
    assert!(
        auth.publish_with(
            "user.events",
            "user.registered",
            &json!({ "type": "user.registered", "email": "a@b.c" }),
            &options
        )
        .await
    );
    assert!(auth.publish("user.events", "profile.viewed", &json!({ "page": 3 })).await);

    assert!(eventually(|| documents.records().len() == 2 && search.records().len() == 2).await);
    let records = documents.records();
    assert_eq!(records[0].event_type, "user.registered");
    assert_eq!(records[0].service, "auth-service");
    assert_eq!(records[0].actor, "u-1");
    assert_eq!(records[1].event_type, FALLBACK_EVENT_TYPE);
    assert_eq!(records[1].actor, "system");
    assert_eq!(records[1].data["page"], 3);
    assert_eq!(audit.stats().handled, 2);
}

#[tokio::test]
async fn failing_sink_does_not_reject_the_message() {
    let broker = InMemoryBroker::new();
    let audit = connected(&broker, "audit-log-service").await;
    let documents = InMemoryAuditSink::new("documents");
    audit
        .subscribe(
            "user.events",
            "#",
            "audit-log-queue",
            AuditHandler::default()
                .with_sink(documents.clone())
                .with_sink(InMemoryAuditSink::failing("search")),
        )
        .await
        .unwrap();

    assert!(audit.publish("user.events", "user.login", &json!({ "type": "user.login" })).await);

    assert!(eventually(|| documents.records().len() == 1).await);
    assert!(eventually(|| audit.stats().handled == 1).await);
    assert_eq!(broker.dead_lettered("audit-log-queue"), 0);
    assert_eq!(broker.queue_depth("audit-log-queue"), 0);
}
