//! Tests for error types

use prometheus_dispatch::core::{Error, Role};

#[test]
fn test_canceled_error() {
    let err = Error::Canceled;
    assert_eq!(format!("{err}"), "operation canceled");
    assert!(err.is_canceled());
    assert!(!err.is_timeout());
}

#[test]
fn test_timeout_error() {
    let err = Error::Timeout;
    assert_eq!(format!("{err}"), "wait timed out");
    assert!(err.is_timeout());
}

#[test]
fn test_abandoned_error() {
    assert_eq!(
        format!("{}", Error::Abandoned),
        "task abandoned before completion"
    );
}

#[test]
fn test_fault_wraps_any_error() {
    let io = std::io::Error::new(std::io::ErrorKind::NotFound, "weights missing");
    let err = Error::fault(io);
    assert_eq!(format!("{err}"), "unhandled fault: weights missing");

    // faults are shared, so every consumer sees the same one
    let copy = err.clone();
    match (err, copy) {
        (Error::Fault(a), Error::Fault(b)) => assert!(std::sync::Arc::ptr_eq(&a, &b)),
        other => panic!("expected faults, got {other:?}"),
    }
}

#[test]
fn test_role_occupied_error() {
    let err = Error::RoleOccupied(Role::Game);
    assert_eq!(format!("{err}"), "dispatch role `game` is already registered");
}

#[test]
fn test_config_and_pool_errors() {
    assert_eq!(
        format!("{}", Error::InvalidConfig("worker_count must be greater than 0".into())),
        "invalid configuration: worker_count must be greater than 0"
    );
    assert_eq!(
        format!("{}", Error::Pool("spawn failed".into())),
        "thread pool error: spawn failed"
    );
}
