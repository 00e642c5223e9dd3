//! Tests for builder modules

use prometheus_dispatch::builders::build_worker_pool;
use prometheus_dispatch::config::{RuntimeConfig, SchedulerConfig, WorkerPoolConfig};
use prometheus_dispatch::core::Error;

#[test]
fn test_build_native_pool() {
    let cfg = SchedulerConfig {
        pool: WorkerPoolConfig::new().with_worker_count(2),
        runtime: RuntimeConfig::Native,
    };
    let pool = build_worker_pool(&cfg).unwrap();
    assert_eq!(pool.stats().worker_count, 2);
    assert!(!pool.is_destroyed());
}

#[test]
fn test_build_rejects_invalid_config() {
    let cfg = SchedulerConfig {
        pool: WorkerPoolConfig::new().with_thread_stack_size(1024),
        runtime: RuntimeConfig::Native,
    };
    let err = build_worker_pool(&cfg).unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)));
}

#[cfg(feature = "tokio-runtime")]
#[test]
fn test_build_tokio_pool() {
    let cfg = SchedulerConfig {
        pool: WorkerPoolConfig::new().with_worker_count(1),
        runtime: RuntimeConfig::Tokio,
    };
    let pool = build_worker_pool(&cfg).unwrap();
    assert_eq!(pool.stats().worker_count, 1);
}
