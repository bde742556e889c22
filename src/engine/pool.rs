//! Bounded worker pool: `worker_count` long-lived workers draining one
//! fixed-capacity FIFO queue.
//!
//! Lifecycle: `Idle -> Running -> Draining -> Stopped`. Closing the queue
//! starts draining; buffered jobs still run, new submissions fail. Each
//! worker runs one job at a time with no timeout or preemption.

use crate::error::{Error, Result};
use crate::model::job::{Job, JobId, PoolState};
use crate::telemetry::metrics;
use crate::telemetry::spans::start_job_span;
use async_trait::async_trait;
use opentelemetry::KeyValue;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, warn};

/// Executes jobs. Errors are the handler's business; the pool does not retry.
#[async_trait]
pub trait JobHandler<T>: Send + Sync {
    async fn handle(&self, worker: usize, job: Job<T>);
}

/// Stand-in for compute-heavy work: sleeps, then logs completion.
pub struct SimulatedWork {
    duration: Duration,
}

impl SimulatedWork {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

#[async_trait]
impl<T: Send + 'static> JobHandler<T> for SimulatedWork {
    async fn handle(&self, worker: usize, job: Job<T>) {
        tokio::time::sleep(self.duration).await;
        info!(worker, job = %job.id, "worker completed job");
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub worker_count: usize,
    pub capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 5,
            capacity: 10,
        }
    }
}

/// Snapshot of pool state and counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub state: PoolState,
    /// Jobs executing right now.
    pub active: usize,
    /// Highest `active` ever observed.
    pub peak_active: usize,
    pub submitted: u64,
    pub rejected: u64,
    pub executed: u64,
    /// Jobs whose handler panicked. The worker survives and moves on.
    pub panicked: u64,
}

#[derive(Default)]
struct Counters {
    active: AtomicUsize,
    peak_active: AtomicUsize,
    submitted: AtomicU64,
    rejected: AtomicU64,
    executed: AtomicU64,
    panicked: AtomicU64,
}

struct Inner<T> {
    config: PoolConfig,
    handler: Arc<dyn JobHandler<T>>,
    state: AtomicU8,
    sender: RwLock<Option<mpsc::Sender<Job<T>>>>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Job<T>>>>,
    /// Workers that have not exited yet.
    live: watch::Sender<usize>,
    counters: Counters,
}

pub struct WorkerPool<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkerPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new(config: PoolConfig, handler: Arc<dyn JobHandler<T>>) -> Self {
        let config = PoolConfig {
            worker_count: config.worker_count.max(1),
            capacity: config.capacity.max(1),
        };
        let (sender, receiver) = mpsc::channel(config.capacity);
        Self {
            inner: Arc::new(Inner {
                config,
                handler,
                state: AtomicU8::new(PoolState::Idle.as_u8()),
                sender: RwLock::new(Some(sender)),
                receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
                live: watch::Sender::new(0),
                counters: Counters::default(),
            }),
        }
    }

    pub fn config(&self) -> PoolConfig {
        self.inner.config
    }

    pub fn state(&self) -> PoolState {
        PoolState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    /// Spawn the workers. Idle → Running.
    pub fn start(&self) -> Result<()> {
        self.transition(PoolState::Idle, PoolState::Running)?;

        self.inner.live.send_replace(self.inner.config.worker_count);
        for id in 0..self.inner.config.worker_count {
            tokio::spawn(worker(id, Arc::clone(&self.inner)));
        }

        info!(
            workers = self.inner.config.worker_count,
            capacity = self.inner.config.capacity,
            "worker pool running"
        );
        Ok(())
    }

    /// Enqueue without waiting. Fails with [`Error::QueueFull`] when there
    /// is no room.
    pub fn try_submit(&self, job: Job<T>) -> Result<JobId> {
        let sender = self.sender()?;
        let id = job.id;
        match sender.try_send(job) {
            Ok(()) => {
                self.accepted(id);
                Ok(id)
            }
            Err(TrySendError::Full(_)) => {
                self.inner.counters.rejected.fetch_add(1, Ordering::SeqCst);
                metrics::jobs_submitted().add(1, &[KeyValue::new("result", "full")]);
                warn!(job = %id, "job rejected, queue full");
                Err(Error::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(self.closed(id)),
        }
    }

    /// Enqueue, waiting for room if the queue is full.
    pub async fn submit(&self, job: Job<T>) -> Result<JobId> {
        let sender = self.sender()?;
        let id = job.id;
        sender.send(job).await.map_err(|_| self.closed(id))?;
        self.accepted(id);
        Ok(id)
    }

    /// Enqueue from a detached task so the caller never waits. The task
    /// itself still waits for room.
    pub fn submit_detached(&self, job: Job<T>) -> JoinHandle<Result<JobId>> {
        let pool = self.clone();
        let id = job.id;
        // Grab the sender now: a submission made before close() still counts.
        let sender = self.sender();
        tokio::spawn(async move {
            let sender = match sender {
                Ok(sender) => sender,
                Err(e) => {
                    warn!(job = %id, error = %e, "job rejected");
                    return Err(e);
                }
            };
            match sender.send(job).await {
                Ok(()) => {
                    pool.accepted(id);
                    Ok(id)
                }
                Err(_) => Err(pool.closed(id)),
            }
        })
    }

    /// Close the queue. Running → Draining (Idle → Stopped). Idempotent.
    pub fn close(&self) -> Result<()> {
        let sender = self.inner.sender.write().ok().and_then(|mut s| s.take());
        drop(sender);

        match self.state() {
            PoolState::Idle => self.transition(PoolState::Idle, PoolState::Stopped),
            PoolState::Running => {
                self.transition(PoolState::Running, PoolState::Draining)?;
                info!("worker pool draining");
                Ok(())
            }
            PoolState::Draining | PoolState::Stopped => Ok(()),
        }
    }

    /// Wait for the workers to drain the queue and exit. Draining → Stopped.
    ///
    /// The queue must be closed first. Every caller waits for the same
    /// drain; none returns while a worker is still running a job.
    pub async fn join(&self) -> Result<()> {
        let state = self.state();
        if state == PoolState::Running {
            return Err(Error::InvalidTransition {
                from: state.to_string(),
                to: PoolState::Stopped.to_string(),
            });
        }

        let mut live = self.inner.live.subscribe();
        // Cannot fail: `inner` owns the sender.
        let _ = live.wait_for(|workers| *workers == 0).await;

        // Concurrent joiners race for this; the losers see Stopped.
        if self.transition(PoolState::Draining, PoolState::Stopped).is_ok() {
            let stats = self.stats();
            info!(
                executed = stats.executed,
                rejected = stats.rejected,
                panicked = stats.panicked,
                "worker pool stopped"
            );
        }
        Ok(())
    }

    /// `close` followed by `join`.
    pub async fn shutdown(&self) -> Result<()> {
        self.close()?;
        self.join().await
    }

    pub fn stats(&self) -> PoolStats {
        let c = &self.inner.counters;
        PoolStats {
            state: self.state(),
            active: c.active.load(Ordering::SeqCst),
            peak_active: c.peak_active.load(Ordering::SeqCst),
            submitted: c.submitted.load(Ordering::SeqCst),
            rejected: c.rejected.load(Ordering::SeqCst),
            executed: c.executed.load(Ordering::SeqCst),
            panicked: c.panicked.load(Ordering::SeqCst),
        }
    }

    fn transition(&self, from: PoolState, to: PoolState) -> Result<()> {
        let invalid = || Error::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        };
        if !from.can_transition_to(to) {
            return Err(invalid());
        }
        self.inner
            .state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| invalid())
    }

    fn sender(&self) -> Result<mpsc::Sender<Job<T>>> {
        match self.state() {
            PoolState::Idle => return Err(Error::PoolNotStarted),
            PoolState::Draining | PoolState::Stopped => return Err(Error::QueueClosed),
            PoolState::Running => {}
        }
        self.inner
            .sender
            .read()
            .ok()
            .and_then(|s| s.clone())
            .ok_or(Error::QueueClosed)
    }

    fn accepted(&self, id: JobId) {
        self.inner.counters.submitted.fetch_add(1, Ordering::SeqCst);
        metrics::jobs_submitted().add(1, &[KeyValue::new("result", "accepted")]);
        debug!(job = %id, "job queued");
    }

    fn closed(&self, id: JobId) -> Error {
        metrics::jobs_submitted().add(1, &[KeyValue::new("result", "closed")]);
        warn!(job = %id, "job rejected, queue closed");
        Error::QueueClosed
    }
}

/// Counts a worker out of `live` however it exits.
struct Exit<'a>(&'a watch::Sender<usize>);

impl Drop for Exit<'_> {
    fn drop(&mut self) {
        self.0.send_modify(|live| *live = live.saturating_sub(1));
    }
}

/// One worker: pull, run, repeat until the queue is closed and empty.
async fn worker<T: Send + 'static>(id: usize, inner: Arc<Inner<T>>) {
    let _exit = Exit(&inner.live);
    debug!(worker = id, "worker started");
    loop {
        let job = {
            let mut receiver = inner.receiver.lock().await;
            receiver.recv().await
        };
        let Some(job) = job else {
            break;
        };

        let counters = &inner.counters;
        let active = counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak_active.fetch_max(active, Ordering::SeqCst);

        let job_id = job.id;
        let span = start_job_span(id, &job_id);
        let started = Instant::now();
        // Run on its own task so a panicking handler cannot take the worker down.
        let handler = Arc::clone(&inner.handler);
        let run = tokio::spawn(async move { handler.handle(id, job).await }.instrument(span));
        let outcome = run.await;

        counters.active.fetch_sub(1, Ordering::SeqCst);
        match outcome {
            Ok(()) => {
                counters.executed.fetch_add(1, Ordering::SeqCst);
                metrics::jobs_executed().add(1, &[]);
            }
            Err(e) => {
                counters.panicked.fetch_add(1, Ordering::SeqCst);
                error!(worker = id, job = %job_id, "job handler failed: {e}");
            }
        }
        metrics::operation_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", "pool.job")],
        );
    }
    debug!(worker = id, "worker exiting, queue drained");
}
