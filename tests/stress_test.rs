//! Stress tests for lost wakeups between producers and blocked waiters.

use prometheus_dispatch::core::{Event, Promise, Task};
use prometheus_dispatch::util::init_tracing;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const ITERATIONS: usize = 10_000;
const GENEROUS: Option<Duration> = Some(Duration::from_secs(10));

fn jitter() {
    let spins = rand::rng().random_range(0..64);
    for _ in 0..spins {
        std::hint::spin_loop();
    }
    if rand::rng().random_bool(0.1) {
        thread::yield_now();
    }
}

#[test]
fn test_event_ping_pong_never_loses_a_wakeup() {
    init_tracing();
    let ping = Event::new();
    let pong = Event::new();

    let (ping_remote, pong_remote) = (ping.clone(), pong.clone());
    let responder = thread::spawn(move || {
        for _ in 0..ITERATIONS {
            assert!(ping_remote.wait_and_reset(GENEROUS));
            jitter();
            pong_remote.set();
        }
    });

    for _ in 0..ITERATIONS {
        jitter();
        ping.set();
        assert!(pong.wait_and_reset(GENEROUS));
    }
    responder.join().unwrap();
}

#[test]
fn test_promise_completion_races_blocking_wait() {
    init_tracing();
    let (tx, rx) = crossbeam_channel::unbounded::<Promise<usize>>();
    let producer = thread::spawn(move || {
        while let Ok(promise) = rx.recv() {
            jitter();
            let value = rand::rng().random_range(0..1000);
            let _ = promise.set_result(value);
        }
    });

    for _ in 0..ITERATIONS {
        let promise = Promise::new();
        let task: Task<usize> = promise.task();
        tx.send(promise).unwrap();
        jitter();
        assert!(task.wait(GENEROUS));
        assert!(task.result().unwrap() < 1000);
    }
    drop(tx);
    producer.join().unwrap();
}

#[test]
fn test_continuations_registered_during_completion_all_run() {
    init_tracing();
    let ran = Arc::new(AtomicUsize::new(0));
    let rounds = ITERATIONS / 10;

    for _ in 0..rounds {
        let promise: Promise<u8> = Promise::new();
        let task = promise.task();
        let completer = thread::spawn(move || {
            jitter();
            let _ = promise.set_result(1);
        });

        let chained: Vec<Task<()>> = (0..3)
            .map(|_| {
                let ran = Arc::clone(&ran);
                task.continue_with(move |r| {
                    if r.is_ok() {
                        ran.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for next in &chained {
            assert!(next.wait(GENEROUS));
        }
        completer.join().unwrap();
    }

    assert_eq!(ran.load(Ordering::SeqCst), rounds * 3);
}
