//! Native `PoolService` using dedicated OS threads.
//!
//! Workers block on a `crossbeam-channel` receiver; one timer thread sleeps on
//! a `parking_lot` condvar until the earliest deadline in a min-heap.
//!
//! # Design Principles
//!
//! - **No polling**: workers block on `recv`, the timer thread on the condvar
//! - **Forced fire**: firing a timer pushes a "due now" heap entry; stale heap
//!   entries for already-run timers are skipped on pop
//! - **Clean shutdown**: dropping the sender unblocks workers naturally

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::config::WorkerPoolConfig;
use crate::core::error::{Error, Result};
use crate::core::handle::{Handle, Notify};

use super::{run_job, Job, PoolService, TimerId};

struct TimerEntry {
    job: Job,
    /// Handle being watched by a registered wait.
    watch: Option<(Handle, Arc<dyn Notify>)>,
}

#[derive(Default)]
struct TimerState {
    due: BinaryHeap<Reverse<(Instant, TimerId)>>,
    entries: HashMap<TimerId, TimerEntry>,
    shutdown: bool,
}

#[derive(Default)]
struct TimerShared {
    state: Mutex<TimerState>,
    cond: Condvar,
}

impl TimerShared {
    fn schedule(state: &mut MutexGuard<'_, TimerState>, id: TimerId, when: Instant) {
        state.due.push(Reverse((when, id)));
    }

    fn fire(&self, id: TimerId) -> bool {
        let mut state = self.state.lock();
        if !state.entries.contains_key(&id) {
            return false;
        }
        Self::schedule(&mut state, id, Instant::now());
        self.cond.notify_one();
        true
    }
}

/// Fires a registered wait when its handle is set.
struct WaitWatcher {
    timers: Weak<TimerShared>,
    id: TimerId,
}

impl Notify for WaitWatcher {
    fn notify(&self) {
        if let Some(timers) = self.timers.upgrade() {
            timers.fire(self.id);
        }
    }
}

struct WorkerSet {
    handles: Vec<JoinHandle<()>>,
    /// Extra workers spawned for long-running callbacks.
    extra: usize,
}

/// Thread-pool service with dedicated worker threads and a timer thread.
pub struct NativePoolService {
    config: WorkerPoolConfig,
    sender: Mutex<Option<Sender<Job>>>,
    receiver: Receiver<Job>,
    workers: Mutex<WorkerSet>,
    busy: Arc<AtomicUsize>,
    timers: Arc<TimerShared>,
    timer_thread: Mutex<Option<JoinHandle<()>>>,
}

impl NativePoolService {
    /// Spawn `config.worker_count` workers and the timer thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Pool`] if a thread cannot be spawned.
    pub fn start(config: &WorkerPoolConfig) -> Result<Self> {
        let (sender, receiver) = unbounded::<Job>();
        let service = Self {
            config: config.clone(),
            sender: Mutex::new(Some(sender)),
            receiver,
            workers: Mutex::new(WorkerSet {
                handles: Vec::with_capacity(config.worker_count),
                extra: 0,
            }),
            busy: Arc::new(AtomicUsize::new(0)),
            timers: Arc::new(TimerShared::default()),
            timer_thread: Mutex::new(None),
        };

        for worker_id in 0..config.worker_count {
            service.spawn_worker(worker_id)?;
        }

        let timers = Arc::clone(&service.timers);
        let sender = service.sender.lock().clone();
        let timer_thread = thread::Builder::new()
            .name(format!("{}-timer", config.thread_name_prefix))
            .spawn(move || timer_loop(&timers, sender))
            .map_err(|e| Error::Pool(format!("failed to spawn timer thread: {e}")))?;
        *service.timer_thread.lock() = Some(timer_thread);

        info!(
            worker_count = config.worker_count,
            stack_size = config.thread_stack_size,
            "native pool service started"
        );
        Ok(service)
    }

    fn spawn_worker(&self, worker_id: usize) -> Result<()> {
        let receiver = self.receiver.clone();
        let busy = Arc::clone(&self.busy);
        let handle = thread::Builder::new()
            .name(format!("{}-{worker_id}", self.config.thread_name_prefix))
            .stack_size(self.config.thread_stack_size)
            .spawn(move || {
                debug!(worker_id, "worker thread started");
                // sender dropped on shutdown: recv fails and the worker exits
                while let Ok(job) = receiver.recv() {
                    busy.fetch_add(1, Ordering::AcqRel);
                    run_job(job);
                    busy.fetch_sub(1, Ordering::AcqRel);
                }
                debug!(worker_id, "worker thread exiting");
            })
            .map_err(|e| Error::Pool(format!("failed to spawn worker {worker_id}: {e}")))?;
        self.workers.lock().handles.push(handle);
        Ok(())
    }

    fn join_all(handles: Vec<JoinHandle<()>>) {
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                // cannot join ourselves; the thread exits once its job returns
                continue;
            }
            if handle.join().is_err() {
                warn!("pool thread panicked during shutdown");
            }
        }
    }
}

impl PoolService for NativePoolService {
    fn submit(&self, job: Job) -> std::result::Result<(), Job> {
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(sender) => sender.send(job).map_err(|e| e.into_inner()),
            None => Err(job),
        }
    }

    fn arm_timer(&self, id: TimerId, delay: Duration, job: Job) -> std::result::Result<(), Job> {
        let mut state = self.timers.state.lock();
        if state.shutdown {
            return Err(job);
        }
        // a delay too large for Instant never fires on its own
        if let Some(when) = Instant::now().checked_add(delay) {
            TimerShared::schedule(&mut state, id, when);
        }
        state.entries.insert(id, TimerEntry { job, watch: None });
        self.timers.cond.notify_one();
        Ok(())
    }

    fn register_wait(
        &self,
        id: TimerId,
        handle: &Handle,
        timeout: Option<Duration>,
        job: Job,
    ) -> std::result::Result<(), Job> {
        let watcher: Arc<dyn Notify> = Arc::new(WaitWatcher {
            timers: Arc::downgrade(&self.timers),
            id,
        });

        {
            let mut state = self.timers.state.lock();
            if state.shutdown {
                return Err(job);
            }
            if let Some(when) = timeout.and_then(|t| Instant::now().checked_add(t)) {
                TimerShared::schedule(&mut state, id, when);
                self.timers.cond.notify_one();
            }
            state.entries.insert(
                id,
                TimerEntry {
                    job,
                    watch: Some((handle.clone(), Arc::clone(&watcher))),
                },
            );
        }

        if handle.watch(&watcher) {
            self.timers.fire(id);
        }
        Ok(())
    }

    fn fire_timer(&self, id: TimerId) -> bool {
        self.timers.fire(id)
    }

    fn may_run_long(&self) {
        let mut workers = self.workers.lock();
        let total = self.config.worker_count + workers.extra;
        if self.busy.load(Ordering::Acquire) < total || workers.extra >= self.config.worker_count {
            return;
        }
        workers.extra += 1;
        let worker_id = total;
        drop(workers);

        debug!(worker_id, "spawning extra worker for long-running callback");
        if let Err(err) = self.spawn_worker(worker_id) {
            warn!(error = %err, "could not add worker for long-running callback");
            self.workers.lock().extra -= 1;
        }
    }

    fn worker_count(&self) -> usize {
        self.config.worker_count
    }

    fn shutdown(&self) {
        {
            let mut state = self.timers.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            self.timers.cond.notify_all();
        }
        self.sender.lock().take();

        let timer_thread = self.timer_thread.lock().take();
        Self::join_all(timer_thread.into_iter().collect());
        let workers = std::mem::take(&mut self.workers.lock().handles);
        let count = workers.len();
        Self::join_all(workers);
        info!(worker_count = count, "native pool service shut down");
    }
}

impl Drop for NativePoolService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Timer thread: run entries as their deadlines pass, handing jobs to workers.
fn timer_loop(timers: &TimerShared, sender: Option<Sender<Job>>) {
    let mut due: Vec<TimerEntry> = Vec::new();
    let mut state = timers.state.lock();

    loop {
        if state.shutdown {
            break;
        }

        let now = Instant::now();
        while let Some(&Reverse((when, id))) = state.due.peek() {
            if when > now {
                break;
            }
            state.due.pop();
            // stale for timers that already ran
            if let Some(entry) = state.entries.remove(&id) {
                due.push(entry);
            }
        }

        if !due.is_empty() {
            MutexGuard::unlocked(&mut state, || {
                for entry in due.drain(..) {
                    if let Some((handle, watcher)) = &entry.watch {
                        handle.unwatch(watcher);
                    }
                    let job = entry.job;
                    match &sender {
                        Some(sender) => {
                            if let Err(err) = sender.send(job) {
                                run_job(err.into_inner());
                            }
                        }
                        None => run_job(job),
                    }
                }
            });
            continue;
        }

        match state.due.peek() {
            Some(&Reverse((when, _))) => {
                let _ = timers.cond.wait_until(&mut state, when);
            }
            None => timers.cond.wait(&mut state),
        }
    }

    let abandoned = state.entries.len();
    let entries = std::mem::take(&mut state.entries);
    drop(state);
    if abandoned > 0 {
        debug!(abandoned, "timer thread exiting with pending timers");
    }
    for entry in entries.into_values() {
        if let Some((handle, watcher)) = &entry.watch {
            handle.unwatch(watcher);
        }
    }
}
