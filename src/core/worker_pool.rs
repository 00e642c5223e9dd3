//! Background worker pool.
//!
//! `WorkerPool` is a thin facade over a [`PoolService`] (the OS thread-pool
//! service) plus in-flight bookkeeping:
//!
//! - **Never drops work**: if the pool is destroyed or the service refuses a
//!   submission, the callback runs synchronously on the caller.
//! - **Timers and waits are tracked**: [`WorkerPool::flush`] fires every
//!   pending timer and wait right away, then blocks until the in-flight count
//!   returns to zero.
//! - **Orderly teardown**: dropping the pool marks it destroyed, flushes, and
//!   joins the service, so no callback observes a destroyed pool mid-run.
//!
//! # Example
//!
//! ```
//! use prometheus_dispatch::config::WorkerPoolConfig;
//! use prometheus_dispatch::core::{CancelToken, WorkerPool};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let pool = WorkerPool::new(WorkerPoolConfig::new().with_worker_count(2)).unwrap();
//! let hits = Arc::new(AtomicUsize::new(0));
//!
//! let h = Arc::clone(&hits);
//! pool.add_task(move || {
//!     h.fetch_add(1, Ordering::SeqCst);
//! });
//! let h = Arc::clone(&hits);
//! pool.add_timer(
//!     move || {
//!         h.fetch_add(1, Ordering::SeqCst);
//!     },
//!     Duration::from_secs(60),
//!     &CancelToken::none(),
//! );
//!
//! // fires the 60s timer now
//! pool.flush();
//! assert_eq!(hits.load(Ordering::SeqCst), 2);
//! ```

mod native;

use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::cancel::{CancelConnection, CancelToken};
use super::error::{Error, Result};
use super::handle::{wait_any, Event, Handle};
use crate::config::{SchedulerConfig, WorkerPoolConfig};

pub use native::NativePoolService;

/// A boxed fire-and-forget callback.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Identifies a timer or wait registration within a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    /// Wrap a raw id.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// The OS thread-pool service behind a [`WorkerPool`].
///
/// Every method that takes a [`Job`] hands it back on refusal so the caller
/// can run it inline instead of dropping it.
pub trait PoolService: Send + Sync {
    /// Queue `job` on a worker thread.
    ///
    /// # Errors
    ///
    /// Returns the job if the service no longer accepts work.
    fn submit(&self, job: Job) -> std::result::Result<(), Job>;

    /// Run `job` once `delay` elapses, or sooner via [`PoolService::fire_timer`].
    ///
    /// # Errors
    ///
    /// Returns the job if the service no longer accepts work.
    fn arm_timer(&self, id: TimerId, delay: Duration, job: Job) -> std::result::Result<(), Job>;

    /// Run `job` when `handle` is set or `timeout` elapses, whichever is first.
    ///
    /// `None` never times out. [`PoolService::fire_timer`] forces it early.
    ///
    /// # Errors
    ///
    /// Returns the job if the service no longer accepts work.
    fn register_wait(
        &self,
        id: TimerId,
        handle: &Handle,
        timeout: Option<Duration>,
        job: Job,
    ) -> std::result::Result<(), Job>;

    /// Fire a pending timer or wait now. Returns `false` if it already ran.
    fn fire_timer(&self, id: TimerId) -> bool;

    /// Best-effort hint from inside a callback that it may block for a while.
    fn may_run_long(&self) {}

    /// Number of dedicated worker threads, if the service has a fixed set.
    fn worker_count(&self) -> usize;

    /// Stop accepting work and release threads.
    ///
    /// Must not block on the calling thread itself when invoked from one of the
    /// service's own threads.
    fn shutdown(&self);
}

/// Service that refuses everything, so every callback runs on its caller.
///
/// Timers run immediately. Waits block the caller until the handle is set or
/// the timeout elapses. Useful for deterministic tests and as the fallback
/// when no threads can be spawned.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineService;

impl PoolService for InlineService {
    fn submit(&self, job: Job) -> std::result::Result<(), Job> {
        Err(job)
    }

    fn arm_timer(&self, _id: TimerId, _delay: Duration, job: Job) -> std::result::Result<(), Job> {
        Err(job)
    }

    fn register_wait(
        &self,
        _id: TimerId,
        _handle: &Handle,
        _timeout: Option<Duration>,
        job: Job,
    ) -> std::result::Result<(), Job> {
        Err(job)
    }

    fn fire_timer(&self, _id: TimerId) -> bool {
        false
    }

    fn worker_count(&self) -> usize {
        0
    }

    fn shutdown(&self) {}
}

thread_local! {
    static IN_POOL_CALLBACK: Cell<bool> = const { Cell::new(false) };
}

/// True while the calling thread is running a pool callback.
#[must_use]
pub fn in_pool_callback() -> bool {
    IN_POOL_CALLBACK.with(Cell::get)
}

/// Run a job as a pool callback: panics are contained and logged.
///
/// Services call this on their worker threads so that a faulting callback ends
/// only itself.
pub fn run_job(job: Job) {
    let was_inside = IN_POOL_CALLBACK.with(|flag| flag.replace(true));
    if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
        let fault = Error::from_panic(payload.as_ref());
        error!(error = %fault, "pool callback panicked");
    }
    IN_POOL_CALLBACK.with(|flag| flag.set(was_inside));
}

/// Statistics about pool utilization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Dedicated worker threads in the service.
    pub worker_count: usize,
    /// Callbacks, timers and waits not yet finished.
    pub in_flight: usize,
    /// Total callbacks, timers and waits accepted.
    pub submitted: u64,
    /// Total that finished (including ones that panicked).
    pub completed: u64,
    /// Total that ran synchronously on the caller.
    pub ran_inline: u64,
    /// Timers and waits still pending.
    pub timers_pending: usize,
}

#[derive(Debug, Default)]
struct PoolCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    ran_inline: AtomicU64,
}

struct PoolShared {
    service: Arc<dyn PoolService>,
    destroyed: AtomicBool,
    in_flight: Mutex<usize>,
    /// Set whenever `in_flight` is zero.
    idle: Event,
    /// Pending timers and waits, with their cancel registrations.
    timers: Mutex<HashMap<TimerId, CancelConnection>>,
    /// Set when a timer is armed, so `flush` picks up late arrivals.
    timer_armed: Event,
    next_timer: AtomicU64,
    counters: PoolCounters,
}

impl PoolShared {
    fn enter(&self) {
        let mut in_flight = self.in_flight.lock();
        if *in_flight == 0 {
            self.idle.reset();
        }
        *in_flight += 1;
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
    }

    fn leave(&self) {
        self.counters.completed.fetch_add(1, Ordering::Relaxed);
        let mut in_flight = self.in_flight.lock();
        *in_flight -= 1;
        if *in_flight == 0 {
            self.idle.set();
        }
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }
}

/// In-flight bookkeeping for one callback, timer or wait.
///
/// Counted on creation; dropping it (after the callback returns, unwinds, or
/// is discarded by a stopped service) counts it out exactly once.
struct TaskRecord {
    callback: Option<Job>,
    pool: Arc<PoolShared>,
    timer: Option<TimerId>,
}

impl TaskRecord {
    fn new(pool: &Arc<PoolShared>, callback: Option<Job>, timer: Option<TimerId>) -> Self {
        pool.enter();
        Self {
            callback,
            pool: Arc::clone(pool),
            timer,
        }
    }

    fn run(mut self) {
        if let Some(callback) = self.callback.take() {
            callback();
        }
    }
}

impl Drop for TaskRecord {
    fn drop(&mut self) {
        if let Some(id) = self.timer {
            let connection = self.pool.timers.lock().remove(&id);
            drop(connection);
        }
        self.pool.leave();
    }
}

/// Fire-and-forget background execution with timers, waits and flush.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    /// Start a pool on a native thread service.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for a bad configuration, or
    /// [`Error::Pool`] if worker threads cannot be spawned.
    pub fn new(config: WorkerPoolConfig) -> Result<Self> {
        config.validate().map_err(Error::InvalidConfig)?;
        let service = NativePoolService::start(&config)?;
        Ok(Self::with_service(Arc::new(service)))
    }

    /// Wrap an existing service.
    #[must_use]
    pub fn with_service(service: Arc<dyn PoolService>) -> Self {
        let worker_count = service.worker_count();
        info!(worker_count, "worker pool started");
        Self {
            shared: Arc::new(PoolShared {
                service,
                destroyed: AtomicBool::new(false),
                in_flight: Mutex::new(0),
                idle: Event::with_state(true),
                timers: Mutex::new(HashMap::new()),
                timer_armed: Event::new(),
                next_timer: AtomicU64::new(1),
                counters: PoolCounters::default(),
            }),
        }
    }

    /// A pool that runs everything on the caller. See [`InlineService`].
    #[must_use]
    pub fn inline() -> Self {
        Self::with_service(Arc::new(InlineService))
    }

    /// Run `callback` on a worker thread.
    ///
    /// Runs it synchronously instead if the pool is destroyed or the service
    /// refuses it.
    pub fn add_task<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let record = TaskRecord::new(&self.shared, Some(Box::new(callback)), None);
        if self.shared.is_destroyed() {
            self.run_inline(Box::new(move || record.run()));
            return;
        }

        if let Err(job) = self.shared.service.submit(Box::new(move || record.run())) {
            warn!("pool service refused task; running inline");
            self.run_inline(job);
        }
    }

    /// Run `callback` after `delay`, unless `token` is canceled by then.
    ///
    /// Canceling the token fires the timer early (and skips the callback).
    /// [`WorkerPool::flush`] fires it immediately.
    pub fn add_timer<F>(&self, callback: F, delay: Duration, token: &CancelToken)
    where
        F: FnOnce() + Send + 'static,
    {
        self.arm_timer(
            move |canceled| {
                if !canceled {
                    callback();
                }
            },
            delay,
            token,
        );
    }

    /// Run `callback(canceled)` after `delay`.
    ///
    /// Unlike [`WorkerPool::add_timer`] the callback always runs; it receives
    /// whether `token` was canceled.
    pub(crate) fn arm_timer<F>(&self, callback: F, delay: Duration, token: &CancelToken)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let id = self.next_timer_id();
        let delay = if token.canceled() { Duration::ZERO } else { delay };
        let record = TaskRecord::new(&self.shared, None, Some(id));
        let observed = token.clone();
        let job: Job = Box::new(move || {
            let _record = record;
            callback(observed.canceled());
        });

        if self.shared.is_destroyed() {
            self.run_inline(job);
            return;
        }

        self.shared.timers.lock().insert(id, CancelConnection::default());
        if let Err(job) = self.shared.service.arm_timer(id, delay, job) {
            self.run_inline(job);
            return;
        }
        self.shared.timer_armed.set();

        if token.is_valid() {
            let service: Weak<dyn PoolService> = Arc::downgrade(&self.shared.service);
            let connection = token.connect(move || {
                if let Some(service) = service.upgrade() {
                    service.fire_timer(id);
                }
            });
            let mut timers = self.shared.timers.lock();
            if let Some(slot) = timers.get_mut(&id) {
                *slot = connection;
            }
        }
    }

    /// Run `callback` when `handle` is set or `timeout` elapses.
    ///
    /// The callback tells the two apart with `handle.is_set()`. A wait forced
    /// by [`WorkerPool::flush`] looks like a timeout. When the service refuses
    /// the wait, the calling thread blocks on `handle` instead.
    pub fn add_wait<F>(&self, callback: F, handle: &Handle, timeout: Option<Duration>)
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.next_timer_id();
        let record = TaskRecord::new(&self.shared, Some(Box::new(callback)), Some(id));
        let job: Job = Box::new(move || record.run());

        if self.shared.is_destroyed() {
            self.run_inline(job);
            return;
        }

        self.shared.timers.lock().insert(id, CancelConnection::default());
        match self.shared.service.register_wait(id, handle, timeout, job) {
            Ok(()) => self.shared.timer_armed.set(),
            Err(job) => {
                // refused: the caller does the waiting, so the callback still
                // runs after the signal or the timeout
                let _ = handle.wait(timeout);
                self.run_inline(job);
            }
        }
    }

    /// Hint from inside a callback that it may block for a while.
    pub fn may_run_long(&self) {
        self.shared.service.may_run_long();
    }

    /// Fire every pending timer and wait, then block until nothing is in flight.
    ///
    /// The calling thread's dispatch queue keeps running while blocked.
    pub fn flush(&self) {
        let shared = &self.shared;
        loop {
            shared.timer_armed.reset();
            let pending: Vec<TimerId> = shared.timers.lock().keys().copied().collect();
            for id in pending {
                shared.service.fire_timer(id);
            }

            let idle = shared.idle.handle();
            let armed = shared.timer_armed.handle();
            if wait_any(&[idle, armed], None) == Some(0) {
                break;
            }
        }
    }

    /// A snapshot of the pool counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let shared = &self.shared;
        PoolStats {
            worker_count: shared.service.worker_count(),
            in_flight: *shared.in_flight.lock(),
            submitted: shared.counters.submitted.load(Ordering::Relaxed),
            completed: shared.counters.completed.load(Ordering::Relaxed),
            ran_inline: shared.counters.ran_inline.load(Ordering::Relaxed),
            timers_pending: shared.timers.lock().len(),
        }
    }

    /// True once teardown has begun.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.shared.is_destroyed()
    }

    fn next_timer_id(&self) -> TimerId {
        TimerId(self.shared.next_timer.fetch_add(1, Ordering::Relaxed))
    }

    fn run_inline(&self, job: Job) {
        self.shared.counters.ran_inline.fetch_add(1, Ordering::Relaxed);
        job();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.destroyed.store(true, Ordering::Release);
        if in_pool_callback() {
            // the running callback is itself in flight
            warn!("worker pool dropped from inside a pool callback; skipping flush");
        } else {
            self.flush();
        }
        self.shared.service.shutdown();
        debug!("worker pool shut down");
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("destroyed", &self.is_destroyed())
            .field("stats", &self.stats())
            .finish()
    }
}

static GLOBAL: OnceLock<WorkerPool> = OnceLock::new();

/// The process-wide pool used by tasks and awaitables.
///
/// Built on first use from [`SchedulerConfig::from_env`]. Falls back to the
/// default configuration if the environment is invalid, and to an
/// [`InlineService`] if no threads can be spawned.
pub fn global() -> &'static WorkerPool {
    GLOBAL.get_or_init(|| {
        let config = SchedulerConfig::from_env().unwrap_or_else(|err| {
            warn!(error = %err, "invalid scheduler environment; using defaults");
            SchedulerConfig::default()
        });
        crate::builders::build_worker_pool(&config).unwrap_or_else(|err| {
            error!(error = %err, "failed to start global worker pool; running inline");
            WorkerPool::inline()
        })
    })
}

/// Install `pool` as the process-wide pool.
///
/// # Errors
///
/// Hands the pool back if the global pool already exists.
pub fn install_global(pool: WorkerPool) -> std::result::Result<(), WorkerPool> {
    GLOBAL.set(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cancel::CancelSource;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> Box<dyn FnOnce() + Send>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let make = move || -> Box<dyn FnOnce() + Send> {
            let h = Arc::clone(&h);
            Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            })
        };
        (hits, make)
    }

    fn small_pool() -> WorkerPool {
        WorkerPool::new(WorkerPoolConfig::new().with_worker_count(2)).unwrap()
    }

    #[test]
    fn test_add_task_and_flush() {
        let pool = small_pool();
        let (hits, make) = counter();
        for _ in 0..20 {
            pool.add_task(make());
        }
        pool.flush();
        assert_eq!(hits.load(Ordering::SeqCst), 20);
        let stats = pool.stats();
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.submitted, 20);
        assert_eq!(stats.completed, 20);
    }

    #[test]
    fn test_flush_fires_timer_early() {
        let pool = small_pool();
        let (hits, make) = counter();
        let start = Instant::now();
        pool.add_timer(make(), Duration::from_millis(50), &CancelToken::none());
        pool.flush();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_timer_skipped_when_canceled() {
        let pool = small_pool();
        let source = CancelSource::new();
        let (hits, make) = counter();
        pool.add_timer(make(), Duration::from_secs(60), &source.token());
        source.cancel();
        pool.flush();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(pool.stats().timers_pending, 0);
    }

    #[test]
    fn test_add_wait_on_signal() {
        let pool = small_pool();
        let handle = Handle::new(false);
        let observed = Arc::new(AtomicBool::new(false));
        let (h, o) = (handle.clone(), Arc::clone(&observed));
        pool.add_wait(move || o.store(h.is_set(), Ordering::SeqCst), &handle, None);
        handle.set();
        pool.flush();
        assert!(observed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_inline_pool_runs_on_caller() {
        let pool = WorkerPool::inline();
        let caller = std::thread::current().id();
        let ran_on = Arc::new(Mutex::new(None));
        let r = Arc::clone(&ran_on);
        pool.add_task(move || *r.lock() = Some(std::thread::current().id()));
        assert_eq!(*ran_on.lock(), Some(caller));
        assert_eq!(pool.stats().ran_inline, 1);
    }

    #[test]
    fn test_inline_pool_wait_blocks_until_signal() {
        let pool = WorkerPool::inline();
        let handle = Handle::new(false);
        let setter = {
            let handle = handle.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                handle.set();
            })
        };

        let observed = Arc::new(AtomicBool::new(false));
        let (h, o) = (handle.clone(), Arc::clone(&observed));
        pool.add_wait(move || o.store(h.is_set(), Ordering::SeqCst), &handle, None);
        assert!(observed.load(Ordering::SeqCst));
        assert_eq!(pool.stats().ran_inline, 1);
        setter.join().unwrap();
    }

    #[test]
    fn test_panicking_task_still_counted_out() {
        let pool = small_pool();
        pool.add_task(|| panic!("boom"));
        pool.flush();
        let stats = pool.stats();
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.completed, 1);
    }
}
