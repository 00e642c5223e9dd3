//! Runtime adapters that back the worker pool with other executors.

#[cfg(feature = "tokio-runtime")]
pub mod tokio_service;

#[cfg(feature = "tokio-runtime")]
pub use tokio_service::TokioPoolService;
