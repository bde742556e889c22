//! Runtime engine: the bounded worker pool and the control plane that
//! wires and tears down the bridge.

pub mod control;
pub mod pool;

pub use control::{Backends, ControlPlane};
pub use pool::{JobHandler, PoolConfig, PoolStats, SimulatedWork, WorkerPool};
