//! Integration tests for blocking waits that cooperate with dispatch queues.

use parking_lot::{Mutex, MutexGuard};
use prometheus_dispatch::core::{dispatch, wait_any, DispatchQueue, Event, Handle, Role};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn registry_lock() -> MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock()
}

#[test]
fn test_blocked_owner_runs_work_posted_to_it() {
    let _guard = registry_lock();
    let main = DispatchQueue::new(Role::Main).unwrap();
    let done = Handle::new(false);

    // the setter only reaches `done` through the main queue
    let remote = done.duplicate();
    let poster = thread::spawn(move || {
        thread::sleep(Duration::from_millis(10));
        dispatch::post(Role::Main, move || remote.set());
    });

    assert!(done.wait(Some(Duration::from_secs(10))));
    assert!(main.is_idle());
    poster.join().unwrap();
}

#[test]
fn test_wait_without_dispatch_leaves_queue_alone() {
    let _guard = registry_lock();
    let game = DispatchQueue::new(Role::Game).unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let h = Arc::clone(&hits);
    let dispatcher = game.dispatcher();
    thread::spawn(move || {
        dispatcher.post(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
    })
    .join()
    .unwrap();

    let never = Handle::new(false);
    assert!(!never.wait_with(Some(Duration::from_millis(20)), false));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert!(!game.is_idle());

    // a pumping wait drains it even though the handle stays unset
    assert!(!never.wait(Some(Duration::from_millis(20))));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn test_zero_timeout_wait_is_a_poll() {
    let _guard = registry_lock();
    let game = DispatchQueue::new(Role::Game).unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = Arc::clone(&hits);
    game.post(move || {
        h.fetch_add(1, Ordering::SeqCst);
    });

    let handle = Handle::new(false);
    assert_eq!(wait_any(&[&handle], Some(Duration::ZERO)), None);
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    game.flush();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn test_wait_any_prefers_lowest_set_index() {
    let a = Handle::new(false);
    let b = Handle::always_set();
    let c = Handle::new(true);
    assert_eq!(wait_any(&[&a, &b, &c], None), Some(1));
}

#[test]
fn test_event_hands_off_between_threads() {
    let ping = Event::new();
    let pong = Event::new();

    let (ping_remote, pong_remote) = (ping.clone(), pong.clone());
    let responder = thread::spawn(move || {
        for _ in 0..5 {
            assert!(ping_remote.wait_and_reset(Some(Duration::from_secs(10))));
            pong_remote.set();
        }
    });

    for _ in 0..5 {
        ping.set();
        assert!(pong.wait_and_reset(Some(Duration::from_secs(10))));
    }
    responder.join().unwrap();

    let handle: Handle = ping.into();
    assert!(!handle.is_set());
}
