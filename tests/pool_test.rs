use async_trait::async_trait;
use relay_rs::engine::{JobHandler, PoolConfig, SimulatedWork, WorkerPool};
use relay_rs::error::Error;
use relay_rs::model::job::{Job, PoolState};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

/// Records the data of every job it runs. Each job waits for a permit.
struct Recorder {
    gate: Semaphore,
    seen: Mutex<Vec<u32>>,
}

impl Recorder {
    fn open() -> Arc<Self> {
        Self::with_permits(Semaphore::MAX_PERMITS)
    }

    fn with_permits(permits: usize) -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(permits),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn seen(&self) -> Vec<u32> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobHandler<u32> for Recorder {
    async fn handle(&self, _worker: usize, job: Job<u32>) {
        if let Ok(permit) = self.gate.acquire().await {
            permit.forget();
        }
        self.seen.lock().unwrap().push(job.data);
    }
}

/// Panics on job 0, records everything else.
struct Brittle {
    seen: Mutex<Vec<u32>>,
}

#[async_trait]
impl JobHandler<u32> for Brittle {
    async fn handle(&self, _worker: usize, job: Job<u32>) {
        if job.data == 0 {
            panic!("job 0 always fails");
        }
        self.seen.lock().unwrap().push(job.data);
    }
}

async fn eventually(check: impl Fn() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s");
}

#[test]
fn pool_state_transitions() {
    use PoolState::*;
    assert!(Idle.can_transition_to(Running));
    assert!(Idle.can_transition_to(Stopped));
    assert!(Running.can_transition_to(Draining));
    assert!(Draining.can_transition_to(Stopped));

    assert!(!Running.can_transition_to(Idle));
    assert!(!Running.can_transition_to(Stopped));
    assert!(!Stopped.can_transition_to(Running));
    assert!(Stopped.is_terminal());
    assert!(!Draining.is_terminal());
}

#[tokio::test]
async fn submit_before_start_is_refused() {
    let pool: WorkerPool<u32> = WorkerPool::new(PoolConfig::default(), Recorder::open());

    assert_eq!(pool.state(), PoolState::Idle);
    assert!(matches!(pool.try_submit(Job::new(1)), Err(Error::PoolNotStarted)));
}

#[tokio::test]
async fn single_worker_runs_jobs_in_submission_order() {
    let recorder = Recorder::open();
    let pool: WorkerPool<u32> = WorkerPool::new(
        PoolConfig {
            worker_count: 1,
            capacity: 4,
        },
        recorder.clone(),
    );
    pool.start().unwrap();

    for i in 0..10 {
        pool.submit(Job::new(i)).await.unwrap();
    }
    pool.shutdown().await.unwrap();

    assert_eq!(recorder.seen(), (0..10).collect::<Vec<_>>());
}

#[tokio::test]
async fn detached_burst_beyond_capacity_loses_nothing() {
    let pool: WorkerPool<()> = WorkerPool::new(
        PoolConfig {
            worker_count: 5,
            capacity: 10,
        },
        Arc::new(SimulatedWork::new(Duration::from_millis(20))),
    );
    pool.start().unwrap();

    // One more than the pool can hold at once.
    let handles: Vec<_> = (0..16).map(|_| pool.submit_detached(Job::bare())).collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    pool.shutdown().await.unwrap();

    let stats = pool.stats();
    assert_eq!(stats.submitted, 16);
    assert_eq!(stats.executed, 16);
    assert_eq!(stats.rejected, 0);
    assert!(stats.peak_active <= 5, "peak {}", stats.peak_active);
    assert_eq!(stats.state, PoolState::Stopped);
}

#[tokio::test]
async fn try_submit_rejects_when_queue_is_full() {
    let recorder = Recorder::with_permits(0);
    let pool: WorkerPool<u32> = WorkerPool::new(
        PoolConfig {
            worker_count: 1,
            capacity: 1,
        },
        recorder.clone(),
    );
    pool.start().unwrap();

    pool.try_submit(Job::new(1)).unwrap();
    eventually(|| pool.stats().active == 1).await;

    pool.try_submit(Job::new(2)).unwrap();
    assert!(matches!(pool.try_submit(Job::new(3)), Err(Error::QueueFull)));
    assert_eq!(pool.stats().rejected, 1);

    recorder.gate.add_permits(2);
    pool.shutdown().await.unwrap();
    assert_eq!(recorder.seen(), vec![1, 2]);
}

#[tokio::test]
async fn close_drains_buffered_jobs_then_refuses_new_ones() {
    let recorder = Recorder::with_permits(0);
    let pool: WorkerPool<u32> = WorkerPool::new(
        PoolConfig {
            worker_count: 2,
            capacity: 8,
        },
        recorder.clone(),
    );
    pool.start().unwrap();
    for i in 0..6 {
        pool.try_submit(Job::new(i)).unwrap();
    }

    pool.close().unwrap();
    assert_eq!(pool.state(), PoolState::Draining);
    assert!(matches!(pool.try_submit(Job::new(99)), Err(Error::QueueClosed)));
    assert!(matches!(
        pool.submit_detached(Job::new(100)).await.unwrap(),
        Err(Error::QueueClosed)
    ));

    recorder.gate.add_permits(6);
    pool.join().await.unwrap();

    let mut seen = recorder.seen();
    seen.sort();
    assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(pool.state(), PoolState::Stopped);
}

#[tokio::test]
async fn join_while_running_is_an_invalid_transition() {
    let pool: WorkerPool<u32> = WorkerPool::new(PoolConfig::default(), Recorder::open());
    pool.start().unwrap();

    assert!(matches!(
        pool.join().await,
        Err(Error::InvalidTransition { .. })
    ));
    assert!(pool.start().is_err());

    pool.shutdown().await.unwrap();
    pool.shutdown().await.unwrap();
    assert_eq!(pool.state(), PoolState::Stopped);
}

#[tokio::test]
async fn closing_an_idle_pool_stops_it() {
    let pool: WorkerPool<u32> = WorkerPool::new(PoolConfig::default(), Recorder::open());
    pool.shutdown().await.unwrap();

    assert_eq!(pool.state(), PoolState::Stopped);
    assert!(pool.start().is_err());
}

#[tokio::test]
async fn concurrent_joins_both_wait_for_the_drain() {
    let recorder = Recorder::with_permits(0);
    let pool: WorkerPool<u32> = WorkerPool::new(
        PoolConfig {
            worker_count: 1,
            capacity: 2,
        },
        recorder.clone(),
    );
    pool.start().unwrap();
    pool.try_submit(Job::new(7)).unwrap();
    eventually(|| pool.stats().active == 1).await;
    pool.close().unwrap();

    let first = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.join().await })
    };
    let second = tokio::time::timeout(Duration::from_millis(100), pool.join()).await;
    assert!(second.is_err(), "join returned while a job was still running");
    assert_eq!(pool.state(), PoolState::Draining);

    recorder.gate.add_permits(1);
    pool.join().await.unwrap();
    first.await.unwrap().unwrap();

    let stats = pool.stats();
    assert_eq!(stats.state, PoolState::Stopped);
    assert_eq!(stats.active, 0);
    assert_eq!(stats.executed, 1);
}

#[tokio::test]
async fn panicking_job_does_not_kill_its_worker() {
    let handler = Arc::new(Brittle {
        seen: Mutex::new(Vec::new()),
    });
    let pool: WorkerPool<u32> = WorkerPool::new(
        PoolConfig {
            worker_count: 1,
            capacity: 4,
        },
        handler.clone(),
    );
    pool.start().unwrap();

    for i in 0..3 {
        pool.submit(Job::new(i)).await.unwrap();
    }
    tokio::time::timeout(Duration::from_secs(2), pool.shutdown())
        .await
        .unwrap()
        .unwrap();

    let stats = pool.stats();
    assert_eq!(stats.state, PoolState::Stopped);
    assert_eq!(stats.active, 0);
    assert_eq!(stats.executed, 2);
    assert_eq!(stats.panicked, 1);
    assert_eq!(*handler.seen.lock().unwrap(), vec![1, 2]);
}
