//! In-process log backend.
//!
//! Used for tests and for running the service without a database. Records
//! live for the lifetime of the process.

use super::{DurableLog, PartitionClaims};
use crate::error::{Error, Result};
use crate::model::{LogRecord, Offset, Record, TopicPartition};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug)]
pub struct MemoryLog {
    partitions: RwLock<HashMap<TopicPartition, Vec<LogRecord>>>,
    appended: Notify,
    available: AtomicBool,
    claims: PartitionClaims,
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLog {
    pub fn new() -> Self {
        Self {
            partitions: RwLock::new(HashMap::new()),
            appended: Notify::new(),
            available: AtomicBool::new(true),
            claims: PartitionClaims::new(),
        }
    }

    /// Simulate the broker going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of records in a partition.
    pub fn len(&self, tp: &TopicPartition) -> usize {
        self.partitions
            .read()
            .map(|p| p.get(tp).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    pub fn is_empty(&self, tp: &TopicPartition) -> bool {
        self.len(tp) == 0
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Unavailable("memory log is offline".to_string()))
        }
    }
}

fn poisoned() -> Error {
    Error::Other("memory log lock poisoned".to_string())
}

#[async_trait]
impl DurableLog for MemoryLog {
    async fn append(&self, tp: &TopicPartition, record: &Record) -> Result<Offset> {
        self.check_available()?;
        let offset = {
            let mut partitions = self.partitions.write().map_err(|_| poisoned())?;
            let records = partitions.entry(tp.clone()).or_default();
            let offset = records.len() as Offset;
            records.push(LogRecord {
                offset,
                key: record.key.clone(),
                payload: record.payload.clone(),
                produced_at: chrono::Utc::now(),
            });
            offset
        };
        self.appended.notify_waiters();
        Ok(offset)
    }

    async fn read(
        &self,
        tp: &TopicPartition,
        from: Offset,
        max: usize,
    ) -> Result<Vec<LogRecord>> {
        self.check_available()?;
        let partitions = self.partitions.read().map_err(|_| poisoned())?;
        let Some(records) = partitions.get(tp) else {
            return Ok(Vec::new());
        };
        let start = from.max(0) as usize;
        Ok(records.iter().skip(start).take(max).cloned().collect())
    }

    async fn earliest_offset(&self, _tp: &TopicPartition) -> Result<Offset> {
        self.check_available()?;
        Ok(0)
    }

    async fn next_offset(&self, tp: &TopicPartition) -> Result<Offset> {
        self.check_available()?;
        Ok(self.len(tp) as Offset)
    }

    async fn wait_for_append(&self, _tp: &TopicPartition, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.appended.notified()).await;
    }

    fn claims(&self) -> &PartitionClaims {
        &self.claims
    }
}
