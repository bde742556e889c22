use async_trait::async_trait;
use relay_rs::bridge::{PublishMode, RepublishSummary};
use relay_rs::config::Config;
use relay_rs::engine::{Backends, ControlPlane};
use relay_rs::error::{Error, Result};
use relay_rs::log::{DurableLog, MemoryLog, PartitionClaims};
use relay_rs::model::job::{Job, PoolState};
use relay_rs::model::{LogRecord, Message, Offset, Record, TopicPartition};
use relay_rs::store::{KvBackend, MemoryKv};
use std::sync::Arc;
use std::time::Duration;

fn config() -> Config {
    Config {
        job_duration_ms: 50,
        poll_interval_ms: 20,
        ..Config::default()
    }
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s");
}

#[tokio::test]
async fn submitted_message_reaches_cache() {
    let control = ControlPlane::start(&config(), Backends::in_memory())
        .await
        .unwrap();

    let key = control
        .bridge()
        .submit(&Message::new("u1", "hello"))
        .await
        .unwrap();

    eventually(|| async { control.bridge().get(&key).await.unwrap().is_some() }).await;
    control.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_runs_queued_jobs_and_settles_publishes() {
    let log = Arc::new(MemoryLog::new());
    let control = ControlPlane::start(
        &config(),
        Backends::new(log.clone(), Arc::new(MemoryKv::new())),
    )
    .await
    .unwrap();

    for _ in 0..3 {
        control.pool().try_submit(Job::bare()).unwrap();
    }
    for i in 0..10 {
        control
            .bridge()
            .submit(&Message::new(format!("u{i}"), "m"))
            .await
            .unwrap();
    }

    control.shutdown().await.unwrap();

    let pool = control.pool().stats();
    assert_eq!(pool.state, PoolState::Stopped);
    assert_eq!(pool.executed, 3);

    let publisher = control.bridge().publisher().stats();
    assert_eq!(publisher.pending(), 0);
    assert_eq!(publisher.delivered, 10);
    assert_eq!(log.len(&TopicPartition::new("testTopic", 0)), 10);
    assert!(control.subscriber_stats().await.is_none());
}

#[tokio::test]
async fn shutdown_is_idempotent_and_refuses_later_work() {
    let control = ControlPlane::start(&config(), Backends::in_memory())
        .await
        .unwrap();

    control.shutdown().await.unwrap();
    control.shutdown().await.unwrap();

    assert!(matches!(
        control.pool().try_submit(Job::bare()),
        Err(Error::QueueClosed)
    ));
    assert!(matches!(
        control.bridge().submit(&Message::new("late", "m")).await,
        Err(Error::PublisherClosed)
    ));
}

#[tokio::test]
async fn subscriber_releases_partition_on_shutdown() {
    let log = Arc::new(MemoryLog::new());
    let tp = TopicPartition::new("testTopic", 0);
    let control = ControlPlane::start(
        &config(),
        Backends::new(log.clone(), Arc::new(MemoryKv::new())),
    )
    .await
    .unwrap();

    assert!(log.claims().is_claimed(&tp));
    control.shutdown().await.unwrap();
    assert!(!log.claims().is_claimed(&tp));
}

#[tokio::test]
async fn shutdown_request_wakes_waiter() {
    let control = ControlPlane::start(&config(), Backends::in_memory())
        .await
        .unwrap();

    let waiter = {
        let control = Arc::clone(&control);
        tokio::spawn(async move { control.shutdown_requested().await })
    };
    control.request_shutdown();

    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .unwrap()
        .unwrap();
    control.shutdown().await.unwrap();
}

/// Log whose appends each take a while.
struct SlowLog {
    inner: MemoryLog,
    delay: Duration,
}

#[async_trait]
impl DurableLog for SlowLog {
    async fn append(&self, tp: &TopicPartition, record: &Record) -> Result<Offset> {
        tokio::time::sleep(self.delay).await;
        self.inner.append(tp, record).await
    }

    async fn read(&self, tp: &TopicPartition, from: Offset, max: usize) -> Result<Vec<LogRecord>> {
        self.inner.read(tp, from, max).await
    }

    async fn earliest_offset(&self, tp: &TopicPartition) -> Result<Offset> {
        self.inner.earliest_offset(tp).await
    }

    async fn next_offset(&self, tp: &TopicPartition) -> Result<Offset> {
        self.inner.next_offset(tp).await
    }

    fn claims(&self) -> &PartitionClaims {
        self.inner.claims()
    }
}

#[tokio::test]
async fn shutdown_waits_for_running_republish() {
    let log = Arc::new(SlowLog {
        inner: MemoryLog::new(),
        delay: Duration::from_millis(50),
    });
    let kv = Arc::new(MemoryKv::new());
    for uid in ["a", "b", "c", "d"] {
        let msg = Message::new(uid, "m");
        kv.set(&Message::key_for(uid), serde_json::to_vec(&msg).unwrap().into())
            .await
            .unwrap();
    }
    let config = Config {
        publish_mode: PublishMode::Sync,
        republish_concurrency: 1,
        ..config()
    };
    let control = ControlPlane::start(&config, Backends::new(log.clone(), kv))
        .await
        .unwrap();

    let republish = control.bridge().republish_all().await.unwrap();
    assert_eq!(republish.keys, 4);
    control.shutdown().await.unwrap();

    assert_eq!(log.inner.len(&TopicPartition::new("testTopic", 0)), 4);
    assert_eq!(
        republish.wait().await,
        RepublishSummary {
            published: 4,
            missing: 0,
            failed: 0
        }
    );
    assert!(matches!(
        control.bridge().republish_all().await,
        Err(Error::PublisherClosed)
    ));
}
