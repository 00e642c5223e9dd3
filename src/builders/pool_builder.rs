//! Builds a worker pool from scheduler configuration.

use tracing::debug;

use crate::config::{RuntimeConfig, SchedulerConfig};
use crate::core::{Error, Result, WorkerPool};

/// Build a worker pool on the service selected by `cfg.runtime`.
///
/// The tokio runtime starts its own multi-threaded runtime sized by the pool
/// settings.
///
/// # Errors
///
/// Returns [`Error::InvalidConfig`] if the configuration is invalid, or
/// [`Error::Pool`] if the service cannot start.
pub fn build_worker_pool(cfg: &SchedulerConfig) -> Result<WorkerPool> {
    cfg.validate().map_err(Error::InvalidConfig)?;
    debug!(runtime = ?cfg.runtime, workers = cfg.pool.worker_count, "building worker pool");

    match cfg.runtime {
        RuntimeConfig::Native => WorkerPool::new(cfg.pool.clone()),
        #[cfg(feature = "tokio-runtime")]
        RuntimeConfig::Tokio => {
            let service = crate::runtime::TokioPoolService::start(&cfg.pool)?;
            Ok(WorkerPool::with_service(std::sync::Arc::new(service)))
        }
        #[cfg(not(feature = "tokio-runtime"))]
        RuntimeConfig::Tokio => Err(Error::InvalidConfig(
            "runtime `tokio` requires the `tokio-runtime` feature".into(),
        )),
    }
}
