//! In-process key-value backend.

use super::KvBackend;
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

/// A `HashMap` behind a lock. Each `set` swaps the whole value, so readers
/// only ever see complete writes.
#[derive(Debug)]
pub struct MemoryKv {
    entries: RwLock<HashMap<String, Bytes>>,
    available: AtomicBool,
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKv {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the cache going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Unavailable("memory cache is offline".to_string()))
        }
    }
}

fn poisoned() -> Error {
    Error::Other("memory cache lock poisoned".to_string())
}

#[async_trait]
impl KvBackend for MemoryKv {
    async fn set(&self, key: &str, value: Bytes) -> Result<()> {
        self.check_available()?;
        self.entries
            .write()
            .map_err(|_| poisoned())?
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.check_available()?;
        Ok(self.entries.read().map_err(|_| poisoned())?.get(key).cloned())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        self.check_available()?;
        Ok(self
            .entries
            .read()
            .map_err(|_| poisoned())?
            .keys()
            .cloned()
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check_available()?;
        Ok(self
            .entries
            .write()
            .map_err(|_| poisoned())?
            .remove(key)
            .is_some())
    }
}
