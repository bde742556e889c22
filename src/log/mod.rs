//! Durable, ordered log abstraction.
//!
//! The publisher appends to a topic partition, the subscriber reads it back
//! with its own cursor. Offsets within a partition are contiguous and
//! assigned in append order.

pub mod memory;

use crate::error::{Error, Result};
use crate::model::{LogRecord, Offset, Record, TopicPartition};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub use memory::MemoryLog;

/// An append-only log with independent producer and consumer cursors.
#[async_trait]
pub trait DurableLog: Send + Sync {
    /// Append a record; returns the offset it was written at.
    async fn append(&self, tp: &TopicPartition, record: &Record) -> Result<Offset>;

    /// Read up to `max` records starting at `from` (inclusive), in offset order.
    async fn read(&self, tp: &TopicPartition, from: Offset, max: usize)
    -> Result<Vec<LogRecord>>;

    /// Offset of the oldest retained record.
    async fn earliest_offset(&self, tp: &TopicPartition) -> Result<Offset>;

    /// Offset the next append will receive.
    async fn next_offset(&self, tp: &TopicPartition) -> Result<Offset>;

    /// Wait until something may have been appended, or `timeout` elapses.
    async fn wait_for_append(&self, _tp: &TopicPartition, timeout: Duration) {
        tokio::time::sleep(timeout).await;
    }

    /// Registry of partitions currently attached to a subscriber.
    fn claims(&self) -> &PartitionClaims;

    /// Stop background work such as notification listeners.
    async fn close(&self) {}
}

// ---------------------------------------------------------------------------
// Partition claims
// ---------------------------------------------------------------------------

/// In-process registry enforcing one reader per partition.
#[derive(Debug, Clone, Default)]
pub struct PartitionClaims {
    held: Arc<Mutex<HashSet<TopicPartition>>>,
}

impl PartitionClaims {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a partition. Fails if another reader holds it.
    pub fn acquire(&self, tp: &TopicPartition) -> Result<PartitionClaim> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| Error::Other("partition claim registry poisoned".to_string()))?;
        if !held.insert(tp.clone()) {
            return Err(Error::PartitionClaimed(tp.to_string()));
        }
        Ok(PartitionClaim {
            tp: tp.clone(),
            held: Arc::clone(&self.held),
        })
    }

    pub fn is_claimed(&self, tp: &TopicPartition) -> bool {
        self.held.lock().map(|h| h.contains(tp)).unwrap_or(false)
    }
}

/// Held by the single subscriber of a partition. Released on drop.
#[derive(Debug)]
pub struct PartitionClaim {
    tp: TopicPartition,
    held: Arc<Mutex<HashSet<TopicPartition>>>,
}

impl PartitionClaim {
    pub fn partition(&self) -> &TopicPartition {
        &self.tp
    }
}

impl Drop for PartitionClaim {
    fn drop(&mut self) {
        if let Ok(mut held) = self.held.lock() {
            held.remove(&self.tp);
        }
    }
}
