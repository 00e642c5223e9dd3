//! Tests for configuration validation and loading

use prometheus_dispatch::config::{RuntimeConfig, SchedulerConfig, WorkerPoolConfig, ENV_PREFIX};
use std::collections::HashMap;

fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (format!("{ENV_PREFIX}{k}"), (*v).to_string()))
        .collect();
    move |key| vars.get(key).cloned()
}

#[test]
fn test_default_config_is_valid() {
    let cfg = SchedulerConfig::default();
    assert!(cfg.validate().is_ok());
    assert!(cfg.pool.worker_count >= 1);
    assert_eq!(cfg.runtime, RuntimeConfig::Native);
}

#[test]
fn test_pool_config_invalid_worker_count() {
    let invalid = WorkerPoolConfig::new().with_worker_count(0);
    assert!(invalid.validate().is_err());
}

#[test]
fn test_pool_config_invalid_stack_size() {
    let invalid = WorkerPoolConfig::new().with_thread_stack_size(4096);
    assert!(invalid.validate().is_err());
}

#[test]
fn test_pool_config_invalid_name_prefix() {
    let invalid = WorkerPoolConfig::new().with_thread_name_prefix("  ");
    assert!(invalid.validate().is_err());
}

#[test]
fn test_scheduler_config_from_json() {
    let json = r#"{
        "pool": { "worker_count": 3, "thread_name_prefix": "render" },
        "runtime": "native"
    }"#;
    let cfg = SchedulerConfig::from_json_str(json).unwrap();
    assert_eq!(cfg.pool.worker_count, 3);
    assert_eq!(cfg.pool.thread_name_prefix, "render");
    // unspecified fields keep their defaults
    assert_eq!(
        cfg.pool.thread_stack_size,
        WorkerPoolConfig::default().thread_stack_size
    );
}

#[test]
fn test_scheduler_config_from_json_rejects_invalid() {
    assert!(SchedulerConfig::from_json_str(r#"{ "pool": { "worker_count": 0 } }"#).is_err());
    assert!(SchedulerConfig::from_json_str(r#"{ "runtime": "fibers" }"#).is_err());
    assert!(SchedulerConfig::from_json_str("not json").is_err());
}

#[test]
fn test_from_lookup_overrides_defaults() {
    let cfg = SchedulerConfig::from_lookup(lookup_from(&[
        ("WORKER_COUNT", " 6 "),
        ("THREAD_STACK_SIZE", "1048576"),
        ("THREAD_NAME_PREFIX", "bg"),
        ("RUNTIME", "NATIVE"),
    ]))
    .unwrap();
    assert_eq!(cfg.pool.worker_count, 6);
    assert_eq!(cfg.pool.thread_stack_size, 1_048_576);
    assert_eq!(cfg.pool.thread_name_prefix, "bg");
    assert_eq!(cfg.runtime, RuntimeConfig::Native);
}

#[test]
fn test_from_lookup_without_variables_uses_defaults() {
    let cfg = SchedulerConfig::from_lookup(|_| None).unwrap();
    assert_eq!(cfg, SchedulerConfig::default());
}

#[test]
fn test_from_lookup_reports_bad_values() {
    let err = SchedulerConfig::from_lookup(lookup_from(&[("WORKER_COUNT", "many")])).unwrap_err();
    assert!(err.contains("WORKER_COUNT"));

    let err = SchedulerConfig::from_lookup(lookup_from(&[("RUNTIME", "green")])).unwrap_err();
    assert!(err.contains("RUNTIME"));

    let err = SchedulerConfig::from_lookup(lookup_from(&[("WORKER_COUNT", "0")])).unwrap_err();
    assert!(err.contains("worker_count"));
}

#[test]
fn test_runtime_config_parsing() {
    assert_eq!("tokio".parse::<RuntimeConfig>().unwrap(), RuntimeConfig::Tokio);
    assert_eq!(" Native ".parse::<RuntimeConfig>().unwrap(), RuntimeConfig::Native);
    assert!("async".parse::<RuntimeConfig>().is_err());
    assert_eq!(serde_json::to_string(&RuntimeConfig::Tokio).unwrap(), "\"tokio\"");
}
