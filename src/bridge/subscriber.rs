//! Subscriber: drains one log partition into the keyed cache.
//!
//! The read loop is the only reader of its partition in the process; the
//! partition claim is taken before the loop starts and released when it
//! exits. Records for the same key are applied in log order in both apply
//! modes.

use crate::error::{Error, Result};
use crate::log::{DurableLog, PartitionClaim};
use crate::model::{Keyed, LogRecord, Offset, StartOffset, TopicPartition};
use crate::store::KeyedStore;
use crate::telemetry::metrics;
use crate::telemetry::spans::start_apply_span;
use opentelemetry::KeyValue;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, OwnedMutexGuard};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{Instrument, debug, error, info, warn};

/// How a read record is applied to the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyMode {
    /// In the read loop, one record at a time.
    #[default]
    Inline,
    /// On a spawned task, serialized per key.
    Concurrent,
}

impl std::str::FromStr for ApplyMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "inline" => Ok(ApplyMode::Inline),
            "concurrent" => Ok(ApplyMode::Concurrent),
            other => Err(Error::Config(format!(
                "invalid apply mode: {other} (expected inline|concurrent)"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    pub partition: TopicPartition,
    pub start: StartOffset,
    pub apply_mode: ApplyMode,
    /// Poll fallback when no append notification arrives.
    pub poll_interval: Duration,
    /// Records fetched per read.
    pub batch_size: usize,
}

impl SubscriberConfig {
    pub fn new(partition: TopicPartition) -> Self {
        Self {
            partition,
            start: StartOffset::Oldest,
            apply_mode: ApplyMode::Inline,
            poll_interval: Duration::from_millis(500),
            batch_size: 100,
        }
    }

    pub fn start(mut self, start: StartOffset) -> Self {
        self.start = start;
        self
    }

    pub fn apply_mode(mut self, mode: ApplyMode) -> Self {
        self.apply_mode = mode;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[derive(Debug, Default)]
struct Counters {
    position: AtomicI64,
    applied: AtomicU64,
    skipped: AtomicU64,
}

/// Snapshot of subscriber progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriberStats {
    /// Offset of the next record to read.
    pub position: Offset,
    pub applied: u64,
    pub skipped: u64,
}

/// Entry point; see [`Subscriber::spawn`].
pub struct Subscriber<M> {
    log: Arc<dyn DurableLog>,
    store: KeyedStore<M>,
    config: SubscriberConfig,
    shutdown: Arc<Notify>,
    counters: Arc<Counters>,
    locks: KeyLocks,
}

/// Handle to a running subscriber loop.
pub struct SubscriberHandle {
    partition: TopicPartition,
    shutdown: Arc<Notify>,
    counters: Arc<Counters>,
    task: JoinHandle<Offset>,
}

impl<M> Subscriber<M>
where
    M: Keyed + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Claim the partition, resolve the start offset, and spawn the read loop.
    ///
    /// Fails with [`Error::PartitionClaimed`] if another subscriber in this
    /// process already reads the partition.
    pub async fn spawn(
        log: Arc<dyn DurableLog>,
        store: KeyedStore<M>,
        config: SubscriberConfig,
    ) -> Result<SubscriberHandle> {
        let claim = log.claims().acquire(&config.partition)?;
        let start = match config.start {
            StartOffset::Oldest => log.earliest_offset(&config.partition).await?,
            StartOffset::Newest => log.next_offset(&config.partition).await?,
        };

        let shutdown = Arc::new(Notify::new());
        let counters = Arc::new(Counters::default());
        counters.position.store(start, Ordering::SeqCst);

        let subscriber = Self {
            log,
            store,
            config: config.clone(),
            shutdown: Arc::clone(&shutdown),
            counters: Arc::clone(&counters),
            locks: KeyLocks::default(),
        };
        let task = tokio::spawn(subscriber.run(claim, start));

        Ok(SubscriberHandle {
            partition: config.partition,
            shutdown,
            counters,
            task,
        })
    }

    async fn run(self, claim: PartitionClaim, mut next: Offset) -> Offset {
        let partition = claim.partition().clone();
        let mut inflight = JoinSet::new();
        info!(%partition, offset = next, mode = ?self.config.apply_mode, "subscriber attached");

        loop {
            while let Some(done) = inflight.try_join_next() {
                log_apply_join(done);
            }

            let batch = tokio::select! {
                biased;
                _ = self.shutdown.notified() => break,
                batch = self.log.read(&partition, next, self.config.batch_size) => batch,
            };

            match batch {
                Ok(records) if records.is_empty() => {
                    tokio::select! {
                        biased;
                        _ = self.shutdown.notified() => break,
                        _ = self.log.wait_for_append(&partition, self.config.poll_interval) => {}
                    }
                }
                Ok(records) => {
                    for record in records {
                        next = record.offset + 1;
                        self.dispatch(&partition, record, &mut inflight).await;
                        self.counters.position.store(next, Ordering::SeqCst);
                    }
                }
                Err(e) => {
                    // One bad read must not end the loop.
                    warn!(%partition, offset = next, error = %e, "log read failed");
                    tokio::select! {
                        biased;
                        _ = self.shutdown.notified() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }

        let pending = inflight.len();
        if pending > 0 {
            info!(%partition, pending, "waiting for in-flight applies");
        }
        while let Some(done) = inflight.join_next().await {
            log_apply_join(done);
        }

        drop(claim);
        info!(%partition, offset = next, "subscriber detached");
        next
    }

    /// Decode a record, then apply it inline or on a task serialized by
    /// the key the write lands on.
    async fn dispatch(
        &self,
        partition: &TopicPartition,
        record: LogRecord,
        inflight: &mut JoinSet<()>,
    ) {
        let Some(entity) = decode::<M>(&record, &self.counters) else {
            return;
        };
        let target = Target {
            partition: partition.clone(),
            key: entity.key(),
            offset: record.offset,
        };
        if target.key != record.key {
            debug!(
                record_key = %record.key,
                entity_key = %target.key,
                "record key differs from entity key"
            );
        }

        match self.config.apply_mode {
            ApplyMode::Inline => {
                apply(&self.store, &target, &entity, &self.counters).await;
            }
            ApplyMode::Concurrent => {
                // Taken here, in log order, so same-key applies cannot reorder.
                let guard = self.locks.lock(&target.key).await;
                let store = self.store.clone();
                let counters = Arc::clone(&self.counters);
                inflight.spawn(async move {
                    let _guard = guard;
                    apply(&store, &target, &entity, &counters).await;
                });
            }
        }
    }
}

impl SubscriberHandle {
    pub fn partition(&self) -> &TopicPartition {
        &self.partition
    }

    /// Offset of the next record the loop will read.
    pub fn position(&self) -> Offset {
        self.counters.position.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> SubscriberStats {
        SubscriberStats {
            position: self.counters.position.load(Ordering::SeqCst),
            applied: self.counters.applied.load(Ordering::SeqCst),
            skipped: self.counters.skipped.load(Ordering::SeqCst),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the loop to stop, wait for in-flight applies, and return the
    /// offset of the next unread record.
    pub async fn stop(self) -> Result<Offset> {
        self.shutdown.notify_one();
        self.task
            .await
            .map_err(|e| Error::Other(format!("subscriber task failed: {e}")))
    }
}

/// Where a decoded record is written.
struct Target {
    partition: TopicPartition,
    key: String,
    offset: Offset,
}

/// Undecodable records are logged and skipped.
fn decode<M: DeserializeOwned>(record: &LogRecord, counters: &Counters) -> Option<M> {
    match serde_json::from_slice(&record.payload) {
        Ok(entity) => Some(entity),
        Err(e) => {
            warn!(
                key = %record.key,
                offset = record.offset,
                error = %e,
                "skipping undecodable record"
            );
            skip(counters);
            None
        }
    }
}

/// Write one entity to the cache. Failures are logged and the record is
/// skipped.
async fn apply<M>(store: &KeyedStore<M>, target: &Target, entity: &M, counters: &Counters)
where
    M: Keyed + Serialize + DeserializeOwned,
{
    let span = start_apply_span(&target.partition, &target.key, target.offset);
    async {
        match store.save(entity).await {
            Ok(()) => {
                counters.applied.fetch_add(1, Ordering::SeqCst);
                metrics::records_applied().add(1, &[KeyValue::new("result", "applied")]);
                debug!(key = %target.key, offset = target.offset, "applied record to cache");
            }
            Err(e) => {
                error!(
                    key = %target.key,
                    offset = target.offset,
                    error = %e,
                    "failed to apply record to cache"
                );
                skip(counters);
            }
        }
    }
    .instrument(span)
    .await
}

fn skip(counters: &Counters) {
    counters.skipped.fetch_add(1, Ordering::SeqCst);
    metrics::records_applied().add(1, &[KeyValue::new("result", "skipped")]);
}

fn log_apply_join(done: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = done {
        error!("apply task ended abnormally: {e}");
    }
}

// ---------------------------------------------------------------------------
// Per-key locks
// ---------------------------------------------------------------------------

/// One async mutex per key, created on demand.
#[derive(Default)]
struct KeyLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyLocks {
    const PRUNE_AT: usize = 1024;

    async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = match self.locks.lock() {
                Ok(l) => l,
                Err(poisoned) => poisoned.into_inner(),
            };
            if locks.len() >= Self::PRUNE_AT {
                // Only the map holds these: nobody is applying that key.
                locks.retain(|_, l| Arc::strong_count(l) > 1);
            }
            Arc::clone(locks.entry(key.to_string()).or_default())
        };
        lock.lock_owned().await
    }
}
