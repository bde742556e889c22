//! Control plane: builds the bridge components from config, owns them for
//! the life of the process, and tears them down in order.

use crate::bridge::{
    Bridge, Publisher, PublisherConfig, ReadPath, Subscriber, SubscriberConfig, SubscriberHandle,
    SubscriberStats,
};
use crate::config::Config;
use crate::config::secrets::ExposeSecret;
use crate::db::{Db, PgKv, PgLog};
use crate::error::Result;
use crate::log::{DurableLog, MemoryLog};
use crate::model::Message;
use crate::store::{KeyedStore, KvBackend, MemoryKv};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{info, warn};

use super::pool::{PoolConfig, SimulatedWork, WorkerPool};

/// Log and cache connections, acquired once at startup.
pub struct Backends {
    pub log: Arc<dyn DurableLog>,
    pub kv: Arc<dyn KvBackend>,
    databases: Vec<Db>,
}

impl Backends {
    /// In-process log and cache.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryLog::new()), Arc::new(MemoryKv::new()))
    }

    pub fn new(log: Arc<dyn DurableLog>, kv: Arc<dyn KvBackend>) -> Self {
        Self {
            log,
            kv,
            databases: Vec::new(),
        }
    }

    /// Connect to Postgres where a URL is configured, in-process otherwise.
    pub async fn connect(config: &Config) -> Result<Self> {
        let mut databases = Vec::new();

        let log: Arc<dyn DurableLog> = match &config.broker_url {
            Some(url) => {
                let db = Db::connect(url.expose_secret()).await?;
                db.migrate().await?;
                let log = PgLog::new(db.clone());
                log.listen().await?;
                databases.push(db);
                info!("durable log: postgres");
                Arc::new(log)
            }
            None => {
                warn!("BROKER_URL not set, using in-process log");
                Arc::new(MemoryLog::new())
            }
        };

        let kv: Arc<dyn KvBackend> = match &config.cache_url {
            Some(url) => {
                let db = Db::connect(url.expose_secret()).await?;
                db.migrate().await?;
                databases.push(db.clone());
                info!("cache: postgres");
                Arc::new(PgKv::new(db))
            }
            None => {
                warn!("CACHE_URL not set, using in-process cache");
                Arc::new(MemoryKv::new())
            }
        };

        Ok(Self {
            log,
            kv,
            databases,
        })
    }

    /// Close database pools, waiting for checked-out connections.
    pub async fn release(self) {
        self.log.close().await;
        for db in &self.databases {
            db.close().await;
        }
    }
}

/// Everything the ingress layer talks to.
pub struct ControlPlane {
    bridge: Bridge<Message>,
    pool: WorkerPool<()>,
    read_path: ReadPath,
    subscriber: tokio::sync::Mutex<Option<SubscriberHandle>>,
    backends: tokio::sync::Mutex<Option<Backends>>,
    shutdown: Arc<Notify>,
}

impl ControlPlane {
    /// Start publisher, subscriber, and worker pool over the given backends.
    pub async fn start(config: &Config, backends: Backends) -> Result<Arc<Self>> {
        let partition = config.topic_partition();

        let publisher = Arc::new(Publisher::start(
            Arc::clone(&backends.log),
            PublisherConfig::new(partition.clone())
                .mode(config.publish_mode)
                .buffer(config.publish_buffer),
        ));

        let store = KeyedStore::<Message>::new(Arc::clone(&backends.kv));

        let subscriber = Subscriber::spawn(
            Arc::clone(&backends.log),
            store.clone(),
            SubscriberConfig::new(partition)
                .start(config.start_offset)
                .apply_mode(config.apply_mode)
                .poll_interval(config.poll_interval()),
        )
        .await?;

        let pool = WorkerPool::new(
            PoolConfig {
                worker_count: config.worker_count,
                capacity: config.queue_capacity,
            },
            Arc::new(SimulatedWork::new(config.job_duration())),
        );
        pool.start()?;

        let bridge = Bridge::new(publisher, store, config.republish_concurrency);

        info!(
            partition = %subscriber.partition(),
            read_path = ?config.read_path,
            "control plane started"
        );

        Ok(Arc::new(Self {
            bridge,
            pool,
            read_path: config.read_path,
            subscriber: tokio::sync::Mutex::new(Some(subscriber)),
            backends: tokio::sync::Mutex::new(Some(backends)),
            shutdown: Arc::new(Notify::new()),
        }))
    }

    pub fn bridge(&self) -> &Bridge<Message> {
        &self.bridge
    }

    pub fn pool(&self) -> &WorkerPool<()> {
        &self.pool
    }

    pub fn read_path(&self) -> ReadPath {
        self.read_path
    }

    /// `None` once the subscriber has been stopped.
    pub async fn subscriber_stats(&self) -> Option<SubscriberStats> {
        self.subscriber.lock().await.as_ref().map(|s| s.stats())
    }

    /// Ask whoever awaits [`shutdown_requested`](Self::shutdown_requested) to stop.
    pub fn request_shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Resolves once [`request_shutdown`](Self::request_shutdown) is called.
    pub async fn shutdown_requested(&self) {
        self.shutdown.notified().await;
    }

    /// Graceful teardown, in order: drain the job queue, stop the
    /// subscriber after its in-flight applies, let running republish
    /// fan-outs finish, settle every accepted publish, then release the
    /// log and cache connections.
    pub async fn shutdown(&self) -> Result<()> {
        info!("control plane shutting down");

        self.pool.shutdown().await?;

        let subscriber = self.subscriber.lock().await.take();
        if let Some(subscriber) = subscriber {
            let offset = subscriber.stop().await?;
            info!(offset, "subscriber stopped");
        }

        self.bridge.drain_republishes().await;
        self.bridge.publisher().close().await;

        let backends = self.backends.lock().await.take();
        if let Some(backends) = backends {
            backends.release().await;
        }

        info!("control plane stopped");
        Ok(())
    }
}
