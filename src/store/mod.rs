//! Keyed cache: a generic entity store over a byte-level key-value backend.
//!
//! Entities are encoded as JSON before storage. A missing key is `Ok(None)`,
//! never an error, so callers can tell "not found" from a backend failure.

pub mod memory;

use crate::error::{Error, Result};
use crate::model::Keyed;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;

pub use memory::MemoryKv;

/// Byte-level key-value backend.
///
/// Safe for concurrent use on independent keys. Writes to the same key
/// must be ordered by the caller.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn set(&self, key: &str, value: Bytes) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// All keys currently stored, in no particular order.
    async fn keys(&self) -> Result<Vec<String>>;

    /// Remove a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;
}

/// Typed view over a [`KvBackend`] for one entity type.
pub struct KeyedStore<M> {
    backend: Arc<dyn KvBackend>,
    _entity: PhantomData<fn() -> M>,
}

impl<M> Clone for KeyedStore<M> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            _entity: PhantomData,
        }
    }
}

impl<M> KeyedStore<M>
where
    M: Keyed + Serialize + DeserializeOwned,
{
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self {
            backend,
            _entity: PhantomData,
        }
    }

    /// Store an entity under its own key. Last write wins.
    pub async fn save(&self, entity: &M) -> Result<()> {
        let encoded = serde_json::to_vec(entity)?;
        self.backend.set(&entity.key(), Bytes::from(encoded)).await
    }

    /// Fetch an entity by key. `Ok(None)` when the key is absent.
    pub async fn get(&self, key: &str) -> Result<Option<M>> {
        match self.backend.get(key).await? {
            Some(bytes) => decode(key, &bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Like [`get`](Self::get) but maps absence to [`Error::NotFound`].
    pub async fn require(&self, key: &str) -> Result<M> {
        self.get(key)
            .await?
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    pub async fn keys(&self) -> Result<Vec<String>> {
        self.backend.keys().await
    }

    /// Every decodable entity in the store. Undecodable values are skipped.
    pub async fn list(&self) -> Result<Vec<M>> {
        let keys = self.backend.keys().await?;
        let mut entities = Vec::with_capacity(keys.len());
        for key in keys {
            match self.get(&key).await {
                Ok(Some(entity)) => entities.push(entity),
                // Deleted between listing and reading.
                Ok(None) => {}
                Err(Error::Malformed(reason)) => {
                    tracing::warn!(%key, %reason, "skipping undecodable cache entry");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(entities)
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.backend.delete(key).await
    }
}

fn decode<M: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<M> {
    serde_json::from_slice(bytes).map_err(|e| Error::Malformed(format!("{key}: {e}")))
}
