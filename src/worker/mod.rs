//! Worker module - bounded concurrent execution for load generation

pub mod pool;

pub use pool::{BatchResults, PoolConfig, TaskOutcome, WorkerPool};
