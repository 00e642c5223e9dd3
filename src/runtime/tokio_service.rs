//! Tokio-backed `PoolService` implementation.
//!
//! Callbacks run on the runtime's blocking pool (`spawn_blocking`), so a
//! callback that blocks never stalls async tasks. Timers and waits are small
//! async tasks that race `tokio::time::sleep` against a `tokio::sync::Notify`
//! used to fire them early.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::{Handle as RuntimeHandle, Runtime};
use tokio::sync::Notify as TokioNotify;
use tracing::{debug, info};

use crate::config::WorkerPoolConfig;
use crate::core::handle::{Handle, Notify};
use crate::core::worker_pool::{run_job, Job, PoolService, TimerId};
use crate::core::{Error, Result};

type TimerMap = Mutex<HashMap<TimerId, Arc<TokioNotify>>>;

/// Wakes a registered wait's task when its handle is set.
struct NotifyOnSet(Arc<TokioNotify>);

impl Notify for NotifyOnSet {
    fn notify(&self) {
        self.0.notify_one();
    }
}

/// Pool service on a tokio runtime, either owned or borrowed.
pub struct TokioPoolService {
    handle: RuntimeHandle,
    /// Present when this service started (and must stop) the runtime.
    runtime: Mutex<Option<Runtime>>,
    worker_count: usize,
    timers: Arc<TimerMap>,
    accepting: AtomicBool,
}

impl TokioPoolService {
    /// Start a dedicated multi-threaded runtime sized by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Pool`] if the runtime cannot be built.
    pub fn start(config: &WorkerPoolConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.worker_count)
            .thread_name(config.thread_name_prefix.clone())
            .thread_stack_size(config.thread_stack_size)
            .enable_time()
            .build()
            .map_err(|e| Error::Pool(format!("failed to build tokio runtime: {e}")))?;

        info!(worker_count = config.worker_count, "tokio pool service started");
        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
            worker_count: config.worker_count,
            timers: Arc::new(Mutex::new(HashMap::new())),
            accepting: AtomicBool::new(true),
        })
    }

    /// Run on an existing runtime. Shutdown leaves the runtime running.
    ///
    /// The runtime must have its time driver enabled.
    #[must_use]
    pub fn from_handle(handle: RuntimeHandle, worker_count: usize) -> Self {
        Self {
            handle,
            runtime: Mutex::new(None),
            worker_count,
            timers: Arc::new(Mutex::new(HashMap::new())),
            accepting: AtomicBool::new(true),
        }
    }

    fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Track `id` and return its early-fire notifier.
    fn track(&self, id: TimerId) -> Arc<TokioNotify> {
        let fire = Arc::new(TokioNotify::new());
        self.timers.lock().insert(id, Arc::clone(&fire));
        fire
    }
}

impl PoolService for TokioPoolService {
    fn submit(&self, job: Job) -> std::result::Result<(), Job> {
        if !self.is_accepting() {
            return Err(job);
        }
        drop(self.handle.spawn_blocking(move || run_job(job)));
        Ok(())
    }

    fn arm_timer(&self, id: TimerId, delay: Duration, job: Job) -> std::result::Result<(), Job> {
        if !self.is_accepting() {
            return Err(job);
        }

        let fire = self.track(id);
        let timers = Arc::clone(&self.timers);
        let runtime = self.handle.clone();
        self.handle.spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = fire.notified() => {}
            }
            timers.lock().remove(&id);
            drop(runtime.spawn_blocking(move || run_job(job)));
        });
        Ok(())
    }

    fn register_wait(
        &self,
        id: TimerId,
        handle: &Handle,
        timeout: Option<Duration>,
        job: Job,
    ) -> std::result::Result<(), Job> {
        if !self.is_accepting() {
            return Err(job);
        }

        let fire = self.track(id);
        let watcher: Arc<dyn Notify> = Arc::new(NotifyOnSet(Arc::clone(&fire)));
        if handle.watch(&watcher) {
            fire.notify_one();
        }

        let timers = Arc::clone(&self.timers);
        let runtime = self.handle.clone();
        let watched = handle.clone();
        self.handle.spawn(async move {
            match timeout {
                Some(timeout) => {
                    tokio::select! {
                        () = tokio::time::sleep(timeout) => {}
                        () = fire.notified() => {}
                    }
                }
                None => fire.notified().await,
            }
            watched.unwatch(&watcher);
            timers.lock().remove(&id);
            drop(runtime.spawn_blocking(move || run_job(job)));
        });
        Ok(())
    }

    fn fire_timer(&self, id: TimerId) -> bool {
        match self.timers.lock().get(&id) {
            Some(fire) => {
                fire.notify_one();
                true
            }
            None => false,
        }
    }

    fn worker_count(&self) -> usize {
        self.worker_count
    }

    fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::AcqRel) {
            return;
        }

        let Some(runtime) = self.runtime.lock().take() else {
            debug!("tokio pool service detached from borrowed runtime");
            return;
        };
        if RuntimeHandle::try_current().is_ok() {
            // blocking shutdown is not allowed from inside a runtime
            runtime.shutdown_background();
        } else {
            runtime.shutdown_timeout(Duration::from_secs(2));
        }
        info!("tokio pool service shut down");
    }
}

impl Drop for TokioPoolService {
    fn drop(&mut self) {
        self.shutdown();
    }
}
