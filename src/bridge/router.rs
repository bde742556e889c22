//! The bridge itself: ingress and read paths over one shared publisher and
//! one keyed cache.

use super::publisher::Publisher;
use crate::error::{Error, Result};
use crate::model::Keyed;
use crate::store::KeyedStore;
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Behaviour of the `/getdata` read path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadPath {
    /// Enumerate cached keys and re-publish each value.
    #[default]
    Republish,
    /// Return the cached values.
    List,
}

impl std::str::FromStr for ReadPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "republish" => Ok(ReadPath::Republish),
            "list" => Ok(ReadPath::List),
            other => Err(Error::Config(format!(
                "invalid read path: {other} (expected republish|list)"
            ))),
        }
    }
}

/// Tally of a finished republish fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepublishSummary {
    pub published: usize,
    /// Keys that disappeared between enumeration and read.
    pub missing: usize,
    pub failed: usize,
}

/// A republish that has enumerated its keys and continues in the background.
pub struct Republish {
    /// Number of keys enumerated, one publish attempt each.
    pub keys: usize,
    handle: JoinHandle<RepublishSummary>,
}

impl Republish {
    /// Wait for every per-key publish to finish.
    pub async fn wait(self) -> RepublishSummary {
        match self.handle.await {
            Ok(summary) => summary,
            Err(e) => {
                error!("republish fan-out ended abnormally: {e}");
                RepublishSummary {
                    failed: self.keys,
                    ..Default::default()
                }
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

enum Republished {
    Published,
    Missing,
    Failed,
}

/// Republish fan-outs still running, and whether new ones are refused.
struct FanOuts {
    running: watch::Sender<usize>,
    closed: AtomicBool,
}

impl FanOuts {
    fn new() -> Self {
        Self {
            running: watch::Sender::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Count a fan-out in. `None` once draining has begun.
    fn enter(self: &Arc<Self>) -> Option<FanOutGuard> {
        self.running.send_modify(|n| *n += 1);
        let guard = FanOutGuard(Arc::clone(self));
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        Some(guard)
    }
}

/// Counts its fan-out out when dropped.
struct FanOutGuard(Arc<FanOuts>);

impl Drop for FanOutGuard {
    fn drop(&mut self) {
        self.0.running.send_modify(|n| *n = n.saturating_sub(1));
    }
}

pub struct Bridge<M> {
    publisher: Arc<Publisher>,
    store: KeyedStore<M>,
    fanout: Arc<Semaphore>,
    fanouts: Arc<FanOuts>,
}

impl<M> Clone for Bridge<M> {
    fn clone(&self) -> Self {
        Self {
            publisher: Arc::clone(&self.publisher),
            store: self.store.clone(),
            fanout: Arc::clone(&self.fanout),
            fanouts: Arc::clone(&self.fanouts),
        }
    }
}

impl<M> Bridge<M>
where
    M: Keyed + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// `republish_concurrency` caps in-flight publishes during a fan-out.
    pub fn new(
        publisher: Arc<Publisher>,
        store: KeyedStore<M>,
        republish_concurrency: usize,
    ) -> Self {
        Self {
            publisher,
            store,
            fanout: Arc::new(Semaphore::new(republish_concurrency.max(1))),
            fanouts: Arc::new(FanOuts::new()),
        }
    }

    pub fn publisher(&self) -> &Arc<Publisher> {
        &self.publisher
    }

    pub fn store(&self) -> &KeyedStore<M> {
        &self.store
    }

    /// Ingress: publish an entity. Returns its key.
    ///
    /// In async mode this only means the record was accepted for delivery.
    pub async fn submit(&self, entity: &M) -> Result<String> {
        let key = entity.key();
        self.publisher.publish_entity(entity).await?;
        Ok(key)
    }

    pub async fn get(&self, key: &str) -> Result<Option<M>> {
        self.store.get(key).await
    }

    /// Read path, list variant: every cached entity.
    pub async fn list(&self) -> Result<Vec<M>> {
        self.store.list().await
    }

    /// Read path, republish variant.
    ///
    /// Enumerates all cached keys and returns as soon as that succeeds. The
    /// per-key re-publishes run in the background; the returned
    /// [`Republish`] can be awaited but does not have to be. If enumeration
    /// fails nothing is published. Refused with [`Error::PublisherClosed`]
    /// once [`drain_republishes`](Self::drain_republishes) has been called.
    pub async fn republish_all(&self) -> Result<Republish> {
        let guard = self.fanouts.enter().ok_or(Error::PublisherClosed)?;
        let keys = self.store.keys().await.map_err(|e| {
            error!(error = %e, "failed to enumerate cached keys");
            e
        })?;

        let count = keys.len();
        info!(keys = count, "republishing cached records");

        let fan_out = fan_out(
            Arc::clone(&self.publisher),
            self.store.clone(),
            Arc::clone(&self.fanout),
            keys,
        );
        let handle = tokio::spawn(async move {
            let _guard = guard;
            fan_out.await
        });
        Ok(Republish {
            keys: count,
            handle,
        })
    }

    /// Refuse new republishes and wait for running fan-outs to finish.
    pub async fn drain_republishes(&self) {
        self.fanouts.closed.store(true, Ordering::SeqCst);
        let mut running = self.fanouts.running.subscribe();
        let pending = *running.borrow_and_update();
        if pending > 0 {
            info!(pending, "waiting for republish fan-outs");
        }
        // Cannot fail: `fanouts` owns the sender.
        let _ = running.wait_for(|n| *n == 0).await;
    }
}

/// One task per key, at most `fanout` permits' worth in flight.
async fn fan_out<M>(
    publisher: Arc<Publisher>,
    store: KeyedStore<M>,
    fanout: Arc<Semaphore>,
    keys: Vec<String>,
) -> RepublishSummary
where
    M: Keyed + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let mut tasks = JoinSet::new();
    let mut summary = RepublishSummary::default();

    for key in keys {
        let Ok(permit) = Arc::clone(&fanout).acquire_owned().await else {
            break;
        };
        let publisher = Arc::clone(&publisher);
        let store = store.clone();
        tasks.spawn(async move {
            let _permit = permit;
            republish_one(&publisher, &store, &key).await
        });
    }

    while let Some(done) = tasks.join_next().await {
        match done {
            Ok(Republished::Published) => summary.published += 1,
            Ok(Republished::Missing) => summary.missing += 1,
            Ok(Republished::Failed) => summary.failed += 1,
            Err(e) => {
                error!("republish task ended abnormally: {e}");
                summary.failed += 1;
            }
        }
    }

    info!(
        published = summary.published,
        missing = summary.missing,
        failed = summary.failed,
        "republish finished"
    );
    summary
}

async fn republish_one<M>(
    publisher: &Publisher,
    store: &KeyedStore<M>,
    key: &str,
) -> Republished
where
    M: Keyed + Serialize + DeserializeOwned,
{
    let result = match store.get(key).await {
        Ok(Some(entity)) => match publisher.publish_entity(&entity).await {
            Ok(_) => Republished::Published,
            Err(e) => {
                warn!(%key, error = %e, "failed to republish cached record");
                Republished::Failed
            }
        },
        Ok(None) => {
            debug!(%key, "key vanished before republish");
            Republished::Missing
        }
        Err(e) => {
            warn!(%key, error = %e, "failed to read cached record");
            Republished::Failed
        }
    };

    let label = match result {
        Republished::Published => "published",
        Republished::Missing => "missing",
        Republished::Failed => "error",
    };
    metrics::records_republished().add(1, &[KeyValue::new("result", label)]);
    result
}
