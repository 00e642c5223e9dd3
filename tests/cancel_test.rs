//! Integration tests for cooperative cancellation.

use parking_lot::Mutex;
use prometheus_dispatch::core::{wait_any, CancelSource, CancelToken, Error};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

#[test]
fn test_listeners_run_once_in_order_and_handle_is_set() {
    let source = CancelSource::new();
    let token = source.token();
    let order = Arc::new(Mutex::new(Vec::new()));

    let connections: Vec<_> = (0..3)
        .map(|i| {
            let order = Arc::clone(&order);
            token.connect(move || order.lock().push(i))
        })
        .collect();
    let handle = token.wait_handle();
    assert!(!handle.is_set());

    source.cancel();
    source.cancel();

    assert_eq!(*order.lock(), vec![0, 1, 2]);
    assert!(handle.wait(Some(Duration::ZERO)));
    assert!(token.canceled());
    assert!(matches!(token.check_canceled(), Err(Error::Canceled)));
    drop(connections);
}

#[test]
fn test_connect_after_cancel_runs_immediately() {
    let source = CancelSource::new();
    source.cancel();

    let hits = Arc::new(AtomicUsize::new(0));
    let h = Arc::clone(&hits);
    let connection = source.token().connect(move || {
        h.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(!connection.is_connected());
    assert!(source.token().wait_handle().is_set());
}

#[test]
fn test_dropped_connection_does_not_fire() {
    let source = CancelSource::new();
    let hits = Arc::new(AtomicUsize::new(0));

    let h = Arc::clone(&hits);
    let connection = source.token().connect(move || {
        h.fetch_add(1, Ordering::SeqCst);
    });
    assert!(connection.is_connected());
    drop(connection);

    source.cancel();
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[test]
fn test_concurrent_cancel_runs_each_listener_once() {
    let source = CancelSource::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let _connections: Vec<_> = (0..16)
        .map(|_| {
            let h = Arc::clone(&hits);
            source.token().connect(move || {
                h.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();

    let barrier = Arc::new(Barrier::new(8));
    let cancelers: Vec<_> = (0..8)
        .map(|_| {
            let source = source.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                source.cancel();
            })
        })
        .collect();
    for canceler in cancelers {
        canceler.join().unwrap();
    }

    assert_eq!(hits.load(Ordering::SeqCst), 16);
    assert!(source.is_canceled());
}

#[test]
fn test_wait_handle_wakes_blocked_thread() {
    let source = CancelSource::new();
    let handle = source.token().wait_handle();

    let waiter = thread::spawn(move || wait_any(&[&handle], Some(Duration::from_secs(10))));
    thread::sleep(Duration::from_millis(10));
    source.cancel();
    assert_eq!(waiter.join().unwrap(), Some(0));
}

#[test]
fn test_no_token_is_never_canceled() {
    let token = CancelToken::none();
    assert!(!token.is_valid());
    assert!(!token.canceled());
    assert!(token.check_canceled().is_ok());
    assert!(!token.wait_handle().wait(Some(Duration::from_millis(5))));
    assert_eq!(token, CancelToken::default());

    let source = CancelSource::new();
    assert_eq!(source.token(), source.token());
    assert_ne!(source.token(), CancelSource::new().token());
}
