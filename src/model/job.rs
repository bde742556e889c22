//! Job and worker-pool lifecycle types.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Newtype for job IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// A unit of work for the pool. `data` is opaque to the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job<T = ()> {
    pub id: JobId,
    pub data: T,
}

impl<T> Job<T> {
    pub fn new(data: T) -> Self {
        Self {
            id: JobId::new(),
            data,
        }
    }
}

impl Job<()> {
    /// A job carrying nothing but its identifier.
    pub fn bare() -> Self {
        Self::new(())
    }
}

/// Lifecycle state of a worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    /// Constructed, no workers yet.
    Idle,
    /// Workers pulling from the queue, submissions accepted.
    Running,
    /// Queue closed, workers finishing buffered jobs.
    Draining,
    /// All workers exited. Terminal.
    Stopped,
}

impl PoolState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: PoolState) -> bool {
        use PoolState::*;
        matches!(
            (self, to),
            (Idle, Running)
                | (Idle, Stopped)       // closed before it ever started
                | (Running, Draining)
                | (Draining, Stopped)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == PoolState::Stopped
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            PoolState::Idle => 0,
            PoolState::Running => 1,
            PoolState::Draining => 2,
            PoolState::Stopped => 3,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => PoolState::Idle,
            1 => PoolState::Running,
            2 => PoolState::Draining,
            _ => PoolState::Stopped,
        }
    }
}

impl std::fmt::Display for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PoolState::Idle => "idle",
            PoolState::Running => "running",
            PoolState::Draining => "draining",
            PoolState::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}
