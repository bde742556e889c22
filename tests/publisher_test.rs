use relay_rs::bridge::{PublishMode, Publisher, PublisherConfig};
use relay_rs::error::Error;
use relay_rs::log::{DurableLog, MemoryLog};
use relay_rs::model::{Delivery, DeliveryOutcome, Message, TopicPartition};
use std::sync::Arc;
use std::time::Duration;

fn tp() -> TopicPartition {
    TopicPartition::new("testTopic", 0)
}

fn start(mode: PublishMode) -> (Arc<MemoryLog>, Publisher) {
    let log = Arc::new(MemoryLog::new());
    let publisher = Publisher::start(
        log.clone() as Arc<dyn DurableLog>,
        PublisherConfig::new(tp()).mode(mode).buffer(8),
    );
    (log, publisher)
}

#[tokio::test]
async fn async_publish_returns_enqueued_and_delivers_in_order() {
    let (log, publisher) = start(PublishMode::Async);

    for i in 0..5 {
        let delivery = publisher.publish(format!("k{i}"), format!("v{i}")).await.unwrap();
        assert_eq!(delivery, Delivery::Enqueued);
    }
    publisher.close().await;

    let records = log.read(&tp(), 0, 10).await.unwrap();
    let keys: Vec<_> = records.iter().map(|r| r.key.as_str()).collect();
    assert_eq!(keys, ["k0", "k1", "k2", "k3", "k4"]);
    assert_eq!(records[4].offset, 4);
}

#[tokio::test]
async fn close_settles_every_accepted_record() {
    let (_, publisher) = start(PublishMode::Async);

    for i in 0..20 {
        publisher.publish(format!("k{i}"), "v").await.unwrap();
    }
    publisher.close().await;

    let stats = publisher.stats();
    assert_eq!(stats.accepted, 20);
    assert_eq!(stats.delivered, 20);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.pending(), 0);
}

#[tokio::test]
async fn async_failure_reaches_outcome_observers() {
    let (log, publisher) = start(PublishMode::Async);
    let mut outcomes = publisher.subscribe_outcomes();
    log.set_available(false);

    // Acceptance does not depend on the log being reachable.
    let delivery = publisher.publish("k", "v").await.unwrap();
    assert_eq!(delivery, Delivery::Enqueued);

    let outcome = tokio::time::timeout(Duration::from_secs(2), outcomes.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, DeliveryOutcome::Failed { ref key, .. } if key == "k"));

    publisher.close().await;
    assert_eq!(publisher.stats().failed, 1);
    assert!(log.is_empty(&tp()));
}

#[tokio::test]
async fn sync_publish_returns_offset() {
    let (log, publisher) = start(PublishMode::Sync);

    assert_eq!(
        publisher.publish("a", "1").await.unwrap(),
        Delivery::Acknowledged(0)
    );
    assert_eq!(
        publisher.publish("b", "2").await.unwrap(),
        Delivery::Acknowledged(1)
    );
    assert_eq!(log.len(&tp()), 2);
    assert_eq!(publisher.stats().delivered, 2);
}

#[tokio::test]
async fn sync_publish_surfaces_transport_error() {
    let (log, publisher) = start(PublishMode::Sync);
    log.set_available(false);

    let err = publisher.publish("a", "1").await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(publisher.stats().failed, 1);
}

#[tokio::test]
async fn publish_entity_uses_entity_key_and_json_payload() {
    let (log, publisher) = start(PublishMode::Sync);
    let msg = Message::new("u1", "hello");

    publisher.publish_entity(&msg).await.unwrap();

    let record = log.read(&tp(), 0, 1).await.unwrap().remove(0);
    assert_eq!(record.key, "message:u1");
    let decoded: Message = serde_json::from_slice(&record.payload).unwrap();
    assert_eq!(decoded, msg);
}

#[tokio::test]
async fn publish_after_close_is_rejected() {
    let (_, publisher) = start(PublishMode::Async);
    publisher.close().await;
    publisher.close().await;

    assert!(publisher.is_closed());
    assert!(matches!(
        publisher.publish("k", "v").await,
        Err(Error::PublisherClosed)
    ));
    assert!(matches!(
        publisher.publish_sync(relay_rs::model::Record::new("k", "v")).await,
        Err(Error::PublisherClosed)
    ));
}

#[tokio::test]
async fn concurrent_publishers_get_distinct_offsets() {
    let (log, publisher) = start(PublishMode::Sync);
    let publisher = Arc::new(publisher);

    let mut tasks = Vec::new();
    for i in 0..10 {
        let publisher = Arc::clone(&publisher);
        tasks.push(tokio::spawn(async move {
            publisher.publish(format!("k{i}"), "v").await.unwrap()
        }));
    }
    let mut offsets = Vec::new();
    for task in tasks {
        match task.await.unwrap() {
            Delivery::Acknowledged(offset) => offsets.push(offset),
            Delivery::Enqueued => panic!("sync publish must acknowledge"),
        }
    }
    offsets.sort();

    assert_eq!(offsets, (0..10).collect::<Vec<_>>());
    assert_eq!(log.len(&tp()), 10);
}
