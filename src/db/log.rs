//! Postgres-backed durable log.
//!
//! Appends take a transaction-scoped advisory lock on the partition, so
//! offsets are assigned gap-free and become visible in order. A NOTIFY on
//! `log_appended` fires on commit and wakes waiting subscribers.

use super::Db;
use crate::error::Result;
use crate::log::{DurableLog, PartitionClaims};
use crate::model::{LogRecord, Offset, Record, TopicPartition};
use crate::telemetry::metrics;
use async_trait::async_trait;
use opentelemetry::KeyValue;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const APPEND_CHANNEL: &str = "log_appended";

pub struct PgLog {
    db: Db,
    appended: Arc<Notify>,
    listener: Mutex<Option<JoinHandle<()>>>,
    claims: PartitionClaims,
}

impl PgLog {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            appended: Arc::new(Notify::new()),
            listener: Mutex::new(None),
            claims: PartitionClaims::new(),
        }
    }

    /// Start forwarding `log_appended` notifications to waiting readers.
    ///
    /// Without a listener, readers fall back to polling.
    pub async fn listen(&self) -> Result<()> {
        let mut listener = sqlx::postgres::PgListener::connect_with(self.db.pool()).await?;
        listener.listen(APPEND_CHANNEL).await?;

        let appended = Arc::clone(&self.appended);
        let handle = tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(n) => {
                        debug!(topic = n.payload(), "log append notification");
                        appended.notify_waiters();
                    }
                    Err(e) => {
                        // recv() reconnects on the next call
                        warn!("PgListener error: {e}, readers fall back to polling");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        if let Ok(mut slot) = self.listener.lock() {
            if let Some(previous) = slot.replace(handle) {
                previous.abort();
            }
        }
        Ok(())
    }

    /// The listener holds a pooled connection; stop it before closing the pool.
    fn stop_listening(&self) {
        let handle = self.listener.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    fn record_op(operation: &'static str) {
        metrics::log_operations().add(
            1,
            &[
                KeyValue::new("backend", "postgres"),
                KeyValue::new("operation", operation),
            ],
        );
    }
}

impl Drop for PgLog {
    fn drop(&mut self) {
        self.stop_listening();
    }
}

#[async_trait]
impl DurableLog for PgLog {
    async fn append(&self, tp: &TopicPartition, record: &Record) -> Result<Offset> {
        let mut tx = self.db.pool().begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1), $2)")
            .bind(&tp.topic)
            .bind(tp.partition)
            .execute(&mut *tx)
            .await?;

        let (offset,): (i64,) = sqlx::query_as(
            "INSERT INTO log_records (topic, partition, log_offset, record_key, payload)
             SELECT $1, $2, COALESCE(MAX(log_offset) + 1, 0), $3, $4
             FROM log_records WHERE topic = $1 AND partition = $2
             RETURNING log_offset",
        )
        .bind(&tp.topic)
        .bind(tp.partition)
        .bind(&record.key)
        .bind(record.payload.as_ref())
        .fetch_one(&mut *tx)
        .await?;

        // NOTIFY is transactional: only fires on commit
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(APPEND_CHANNEL)
            .bind(&tp.topic)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Self::record_op("append");
        Ok(offset)
    }

    async fn read(
        &self,
        tp: &TopicPartition,
        from: Offset,
        max: usize,
    ) -> Result<Vec<LogRecord>> {
        let rows: Vec<LogRecordRow> = sqlx::query_as(
            "SELECT log_offset, record_key, payload, produced_at
             FROM log_records
             WHERE topic = $1 AND partition = $2 AND log_offset >= $3
             ORDER BY log_offset ASC
             LIMIT $4",
        )
        .bind(&tp.topic)
        .bind(tp.partition)
        .bind(from)
        .bind(max as i64)
        .fetch_all(self.db.pool())
        .await?;

        Self::record_op(if rows.is_empty() { "read_empty" } else { "read" });
        Ok(rows.into_iter().map(LogRecord::from).collect())
    }

    async fn earliest_offset(&self, tp: &TopicPartition) -> Result<Offset> {
        let (offset,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(MIN(log_offset), 0) FROM log_records \
             WHERE topic = $1 AND partition = $2",
        )
        .bind(&tp.topic)
        .bind(tp.partition)
        .fetch_one(self.db.pool())
        .await?;
        Ok(offset)
    }

    async fn next_offset(&self, tp: &TopicPartition) -> Result<Offset> {
        let (offset,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(log_offset) + 1, 0) FROM log_records \
             WHERE topic = $1 AND partition = $2",
        )
        .bind(&tp.topic)
        .bind(tp.partition)
        .fetch_one(self.db.pool())
        .await?;
        Ok(offset)
    }

    async fn wait_for_append(&self, _tp: &TopicPartition, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.appended.notified()).await;
    }

    fn claims(&self) -> &PartitionClaims {
        &self.claims
    }

    async fn close(&self) {
        self.stop_listening();
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct LogRecordRow {
    log_offset: i64,
    record_key: String,
    payload: Vec<u8>,
    produced_at: chrono::DateTime<chrono::Utc>,
}

impl From<LogRecordRow> for LogRecord {
    fn from(row: LogRecordRow) -> Self {
        Self {
            offset: row.log_offset,
            key: row.record_key,
            payload: row.payload.into(),
            produced_at: row.produced_at,
        }
    }
}
