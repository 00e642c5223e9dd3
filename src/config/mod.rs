//! Configuration models for the worker pool and its runtime.

pub mod pool;

pub use pool::{RuntimeConfig, SchedulerConfig, WorkerPoolConfig, ENV_PREFIX};
