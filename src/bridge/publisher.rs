//! Publisher: hands records to the durable log.
//!
//! Two disciplines share one instance:
//!
//! - **async** (`publish_async`): the record goes into a bounded send
//!   channel and the call returns. A single delivery task appends records in
//!   channel order; a single outcome task logs and counts each result.
//! - **sync** (`publish_sync`): the call waits for the log to acknowledge the
//!   append and returns the offset or the error.
//!
//! Both go through [`LogClient`], which serializes access to the log. No
//! retries happen here.

use crate::error::{Error, Result};
use crate::log::DurableLog;
use crate::model::{Delivery, DeliveryOutcome, Keyed, Offset, Record, TopicPartition};
use crate::telemetry::metrics;
use crate::telemetry::spans::{record_offset, start_publish_span};
use bytes::Bytes;
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, warn};

/// Which discipline `publish` uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishMode {
    #[default]
    Async,
    Sync,
}

impl std::str::FromStr for PublishMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "async" => Ok(PublishMode::Async),
            "sync" => Ok(PublishMode::Sync),
            other => Err(Error::Config(format!(
                "invalid publish mode: {other} (expected async|sync)"
            ))),
        }
    }
}

impl std::fmt::Display for PublishMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            PublishMode::Async => "async",
            PublishMode::Sync => "sync",
        })
    }
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub partition: TopicPartition,
    pub mode: PublishMode,
    /// Capacity of the async send channel.
    pub buffer: usize,
}

impl PublisherConfig {
    pub fn new(partition: TopicPartition) -> Self {
        Self {
            partition,
            mode: PublishMode::Async,
            buffer: 256,
        }
    }

    pub fn mode(mut self, mode: PublishMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer;
        self
    }
}

// ---------------------------------------------------------------------------
// LogClient
// ---------------------------------------------------------------------------

/// The log handle, with one send in flight at a time.
pub struct LogClient {
    log: Arc<dyn DurableLog>,
    sending: tokio::sync::Mutex<()>,
}

impl LogClient {
    pub fn new(log: Arc<dyn DurableLog>) -> Self {
        Self {
            log,
            sending: tokio::sync::Mutex::new(()),
        }
    }

    /// Append one record inside the critical section.
    pub async fn send(&self, tp: &TopicPartition, record: &Record) -> Result<Offset> {
        let _guard = self.sending.lock().await;
        self.log.append(tp, record).await
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Counters {
    accepted: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

/// Snapshot of publisher counters.
///
/// Every accepted record eventually lands in `delivered` or `failed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublisherStats {
    pub accepted: u64,
    pub delivered: u64,
    pub failed: u64,
}

impl PublisherStats {
    /// Accepted records without an outcome yet.
    pub fn pending(&self) -> u64 {
        self.accepted.saturating_sub(self.delivered + self.failed)
    }
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

pub struct Publisher {
    partition: TopicPartition,
    mode: PublishMode,
    client: Arc<LogClient>,
    sender: RwLock<Option<mpsc::Sender<Record>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
    observers: broadcast::Sender<DeliveryOutcome>,
}

impl Publisher {
    /// Create the publisher and spawn its delivery and outcome tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(log: Arc<dyn DurableLog>, config: PublisherConfig) -> Self {
        let client = Arc::new(LogClient::new(log));
        let counters = Arc::new(Counters::default());
        let (observers, _) = broadcast::channel(config.buffer.max(16));

        let (record_tx, record_rx) = mpsc::channel(config.buffer);
        let (outcome_tx, outcome_rx) = mpsc::channel(config.buffer);

        let delivery = tokio::spawn(deliver(
            Arc::clone(&client),
            config.partition.clone(),
            record_rx,
            outcome_tx,
        ));
        let outcomes = tokio::spawn(handle_outcomes(
            outcome_rx,
            Arc::clone(&counters),
            observers.clone(),
        ));

        info!(partition = %config.partition, mode = %config.mode, "publisher started");

        Self {
            partition: config.partition,
            mode: config.mode,
            client,
            sender: RwLock::new(Some(record_tx)),
            tasks: Mutex::new(vec![delivery, outcomes]),
            counters,
            observers,
        }
    }

    pub fn mode(&self) -> PublishMode {
        self.mode
    }

    pub fn partition(&self) -> &TopicPartition {
        &self.partition
    }

    /// Publish using the configured discipline.
    pub async fn publish(
        &self,
        key: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Result<Delivery> {
        self.publish_record(Record::new(key, payload)).await
    }

    pub async fn publish_record(&self, record: Record) -> Result<Delivery> {
        match self.mode {
            PublishMode::Async => self.publish_async(record).await,
            PublishMode::Sync => self.publish_sync(record).await,
        }
    }

    /// Encode an entity as JSON and publish it under its own key.
    pub async fn publish_entity<M>(&self, entity: &M) -> Result<Delivery>
    where
        M: Keyed + Serialize,
    {
        let key = entity.key();
        let payload = serde_json::to_vec(entity).map_err(|e| {
            warn!(%key, error = %e, "failed to encode record");
            metrics::records_published().add(
                1,
                &[
                    KeyValue::new("mode", self.mode.to_string()),
                    KeyValue::new("result", "error"),
                ],
            );
            Error::Serialization(e)
        })?;
        self.publish_record(Record::new(key, payload)).await
    }

    /// Enqueue for background delivery. Waits only if the send channel is full.
    pub async fn publish_async(&self, record: Record) -> Result<Delivery> {
        let span = start_publish_span(&record.key, "async");
        let sender = self.sender()?;
        let key = record.key.clone();

        async {
            self.counters.accepted.fetch_add(1, Ordering::SeqCst);
            if sender.send(record).await.is_err() {
                self.counters.accepted.fetch_sub(1, Ordering::SeqCst);
                warn!(%key, "publish rejected, send path closed");
                return Err(Error::PublisherClosed);
            }
            debug!(%key, "record enqueued");
            metrics::records_published().add(
                1,
                &[
                    KeyValue::new("mode", "async"),
                    KeyValue::new("result", "enqueued"),
                ],
            );
            Ok(Delivery::Enqueued)
        }
        .instrument(span)
        .await
    }

    /// Append and wait for the log's acknowledgement.
    pub async fn publish_sync(&self, record: Record) -> Result<Delivery> {
        if self.is_closed() {
            return Err(Error::PublisherClosed);
        }
        let span = start_publish_span(&record.key, "sync");

        async {
            self.counters.accepted.fetch_add(1, Ordering::SeqCst);
            match self.client.send(&self.partition, &record).await {
                Ok(offset) => {
                    self.counters.delivered.fetch_add(1, Ordering::SeqCst);
                    record_offset(&tracing::Span::current(), offset);
                    info!(key = %record.key, offset, "produced record to log");
                    metrics::records_published().add(
                        1,
                        &[
                            KeyValue::new("mode", "sync"),
                            KeyValue::new("result", "acknowledged"),
                        ],
                    );
                    Ok(Delivery::Acknowledged(offset))
                }
                Err(e) => {
                    self.counters.failed.fetch_add(1, Ordering::SeqCst);
                    error!(key = %record.key, error = %e, "failed to produce record to log");
                    metrics::records_published().add(
                        1,
                        &[
                            KeyValue::new("mode", "sync"),
                            KeyValue::new("result", "error"),
                        ],
                    );
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Receive a copy of every async delivery outcome from now on.
    pub fn subscribe_outcomes(&self) -> broadcast::Receiver<DeliveryOutcome> {
        self.observers.subscribe()
    }

    pub fn stats(&self) -> PublisherStats {
        PublisherStats {
            accepted: self.counters.accepted.load(Ordering::SeqCst),
            delivered: self.counters.delivered.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.read().map(|s| s.is_none()).unwrap_or(true)
    }

    /// Close the send path and wait until every accepted record has an
    /// outcome. Idempotent.
    pub async fn close(&self) {
        let sender = self.sender.write().ok().and_then(|mut s| s.take());
        if sender.is_none() {
            return;
        }
        drop(sender);

        let tasks: Vec<_> = self
            .tasks
            .lock()
            .map(|mut t| t.drain(..).collect())
            .unwrap_or_default();
        for task in tasks {
            if let Err(e) = task.await {
                error!("publisher task ended abnormally: {e}");
            }
        }

        let stats = self.stats();
        info!(
            accepted = stats.accepted,
            delivered = stats.delivered,
            failed = stats.failed,
            "publisher closed"
        );
    }

    fn sender(&self) -> Result<mpsc::Sender<Record>> {
        self.sender
            .read()
            .ok()
            .and_then(|s| s.clone())
            .ok_or(Error::PublisherClosed)
    }
}

/// Drain the send channel into the log, one record at a time.
async fn deliver(
    client: Arc<LogClient>,
    partition: TopicPartition,
    mut records: mpsc::Receiver<Record>,
    outcomes: mpsc::Sender<DeliveryOutcome>,
) {
    while let Some(record) = records.recv().await {
        let outcome = match client.send(&partition, &record).await {
            Ok(offset) => DeliveryOutcome::Delivered {
                key: record.key,
                offset,
            },
            Err(e) => DeliveryOutcome::Failed {
                key: record.key,
                error: e.to_string(),
            },
        };
        if let Err(lost) = outcomes.send(outcome).await {
            error!(key = lost.0.key(), "outcome handler gone, outcome dropped");
        }
    }
    debug!(%partition, "delivery task finished");
}

/// Log and count every delivery outcome.
async fn handle_outcomes(
    mut outcomes: mpsc::Receiver<DeliveryOutcome>,
    counters: Arc<Counters>,
    observers: broadcast::Sender<DeliveryOutcome>,
) {
    while let Some(outcome) = outcomes.recv().await {
        match &outcome {
            DeliveryOutcome::Delivered { key, offset } => {
                counters.delivered.fetch_add(1, Ordering::SeqCst);
                info!(%key, offset, "produced record to log");
            }
            DeliveryOutcome::Failed { key, error } => {
                counters.failed.fetch_add(1, Ordering::SeqCst);
                error!(%key, %error, "failed to produce record to log");
            }
        }
        metrics::delivery_outcomes().add(
            1,
            &[KeyValue::new(
                "result",
                if outcome.is_delivered() {
                    "delivered"
                } else {
                    "failed"
                },
            )],
        );
        // No observers is fine.
        let _ = observers.send(outcome);
    }
}
