//! Thread-affinity dispatch queues.
//!
//! Each [`Role`] (main, game, frame, background task) can have one active
//! [`DispatchQueue`], owned by the thread that created it. Any thread may post
//! callbacks to a queue through a [`Dispatcher`]; only the owning thread (or
//! a forced flush) runs them.
//!
//! Queue lifecycle:
//!
//! - **idle**: empty, flushed signal set
//! - **pending**: non-empty, flushed signal cleared, wake signal set, owner woken
//! - **draining**: the owner (or a forced caller) runs queued callbacks
//!
//! The owner wakes exactly once per idle → pending transition, either through a
//! [`PlatformWaker`] or by blocking in [`DispatchQueue::wait_for_dispatch`] (or
//! any [`Handle::wait`](super::Handle::wait), which pumps the queue).
//!
//! # Examples
//!
//! ```
//! use prometheus_dispatch::core::{dispatch, DispatchQueue, Role};
//!
//! let queue = DispatchQueue::new(Role::Game).unwrap();
//! let remote = dispatch::get(Role::Game).unwrap();
//!
//! let value = std::thread::spawn(move || {
//!     remote.post(|| println!("runs on the game thread"));
//! });
//! value.join().unwrap();
//!
//! queue.flush();
//! ```

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::error::{Error, Result};
use super::handle::{block_any, deadline_after, Event, Handle};
use super::worker_pool::Job;

/// Logical thread identities that a dispatch queue can be pinned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Main UI thread.
    Main,
    /// Game thread, dispatches between frame updates.
    Game,
    /// Game thread, only during a frame update.
    Frame,
    /// Background work, not tied to the game or UI.
    Task,
}

impl Role {
    /// Every role, in registry slot order.
    pub const ALL: [Self; 4] = [Self::Main, Self::Game, Self::Frame, Self::Task];

    const fn slot(self) -> usize {
        match self {
            Self::Main => 0,
            Self::Game => 1,
            Self::Frame => 2,
            Self::Task => 3,
        }
    }

    /// Roles that always resume on their queue owner's thread.
    pub(crate) const fn is_thread_bound(self) -> bool {
        matches!(self, Self::Main | Self::Game | Self::Frame)
    }

    /// The role of the calling thread.
    ///
    /// Frame wins over game (both live on the game thread). Threads that own
    /// no main/game/frame queue are [`Role::Task`].
    #[must_use]
    pub fn current() -> Self {
        let id = thread::current().id();
        let slots = REGISTRY.lock();
        [Self::Frame, Self::Main, Self::Game]
            .into_iter()
            .find(|role| slots[role.slot()].as_ref().is_some_and(|q| q.owner == id))
            .unwrap_or(Self::Task)
    }

    /// True if code running now may resume as this role without a hop.
    ///
    /// For thread-bound roles that means "on the active queue's owner thread".
    /// For [`Role::Task`] it means "not on any main/game/frame owner thread".
    #[must_use]
    pub fn is_current(self) -> bool {
        if self.is_thread_bound() {
            get(self).is_some_and(|q| q.is_current_thread())
        } else {
            Self::current() == Self::Task
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Main => "main",
            Self::Game => "game",
            Self::Frame => "frame",
            Self::Task => "task",
        };
        f.write_str(name)
    }
}

/// Host hook that wakes a queue owner's event loop.
///
/// Called at most once per idle → pending transition. On waking, the owner
/// must call [`DispatchQueue::flush`].
pub trait PlatformWaker: Send + Sync {
    /// Ask the owning thread's loop to flush its queue.
    fn wake(&self);
}

struct QueueState {
    pending: VecDeque<Job>,
    destroyed: bool,
}

pub(crate) struct QueueShared {
    role: Role,
    owner: ThreadId,
    state: Mutex<QueueState>,
    wake_signal: Event,
    flushed_signal: Event,
    waker: Option<Arc<dyn PlatformWaker>>,
}

static REGISTRY: Mutex<[Option<Arc<QueueShared>>; 4]> = Mutex::new([None, None, None, None]);

thread_local! {
    /// Queues owned by this thread, innermost last.
    static OWNED: RefCell<Vec<Arc<QueueShared>>> = const { RefCell::new(Vec::new()) };
}

/// The active queue for `role`, if any.
#[must_use]
pub fn get(role: Role) -> Option<Dispatcher> {
    REGISTRY.lock()[role.slot()]
        .as_ref()
        .map(|shared| Dispatcher {
            shared: Arc::clone(shared),
        })
}

/// Post to `role`'s queue, or run inline if that role has no active queue.
pub fn post<F>(role: Role, callback: F)
where
    F: FnOnce() + Send + 'static,
{
    match get(role) {
        Some(dispatcher) => dispatcher.post(callback),
        None => callback(),
    }
}

/// The innermost queue owned by the calling thread.
pub(crate) fn current_owned_queue() -> Option<Arc<QueueShared>> {
    OWNED
        .try_with(|owned| owned.borrow().last().cloned())
        .ok()
        .flatten()
}

impl QueueShared {
    fn is_current_thread(&self) -> bool {
        self.owner == thread::current().id()
    }

    fn post(&self, job: Job, run_if_current_thread: bool) {
        if run_if_current_thread && self.is_current_thread() {
            job();
            return;
        }

        let wake = {
            let mut state = self.state.lock();
            if state.destroyed {
                drop(state);
                job();
                return;
            }

            let was_empty = state.pending.is_empty();
            state.pending.push_back(job);
            if was_empty {
                self.flushed_signal.reset();
                if self.wake_signal.is_set() {
                    false
                } else {
                    self.wake_signal.set();
                    true
                }
            } else {
                false
            }
        };

        if wake {
            trace!(role = %self.role, "dispatch queue woken");
            if let Some(waker) = &self.waker {
                waker.wake();
            }
        }
    }

    fn flush(&self, force: bool) {
        if force || self.is_current_thread() {
            self.drain();
        } else {
            // the owner drains; everyone else waits for it
            let _ = self.flushed_signal.wait(None);
        }
    }

    /// Run queued callbacks until the queue is observed empty under the lock.
    ///
    /// A panicking callback does not stop the drain: the rest of the queue
    /// still runs and the signals are reset before the first panic resumes.
    fn drain(&self) {
        let mut first_panic = None;
        loop {
            let batch = {
                let mut state = self.state.lock();
                if state.pending.is_empty() {
                    self.flushed_signal.set();
                    self.wake_signal.reset();
                    break;
                }
                std::mem::take(&mut state.pending)
            };

            trace!(role = %self.role, count = batch.len(), "draining dispatch queue");
            for job in batch {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                    warn!(role = %self.role, "dispatch callback panicked");
                    first_panic.get_or_insert(payload);
                }
            }
        }

        if let Some(payload) = first_panic {
            panic::resume_unwind(payload);
        }
    }

    fn send<R, F>(&self, callback: F, timeout: Option<Duration>) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        if self.is_current_thread() {
            return Ok(callback());
        }

        struct SetOnDrop(Event);
        impl Drop for SetOnDrop {
            fn drop(&mut self) {
                self.0.set();
            }
        }

        let done = Event::new();
        let slot = Arc::new(Mutex::new(None));
        let (signal, result) = (SetOnDrop(done.clone()), Arc::clone(&slot));
        self.post(
            Box::new(move || {
                let _signal = signal;
                *result.lock() = Some(callback());
            }),
            false,
        );

        if !done.wait(timeout) {
            return Err(Error::Timeout);
        }
        // empty slot: the callback panicked or was dropped unrun
        let value = slot.lock().take();
        value.ok_or(Error::Abandoned)
    }

    /// Wait for any of `handles` while draining this (owned) queue whenever its
    /// wake signal fires.
    pub(crate) fn wait_any_pumping(
        &self,
        handles: &[&Handle],
        deadline: Option<Instant>,
    ) -> Option<usize> {
        debug_assert!(self.is_current_thread());
        let mut all: Vec<&Handle> = handles.to_vec();
        all.push(self.wake_signal.handle());

        loop {
            match block_any(&all, deadline) {
                Some(index) if index < handles.len() => return Some(index),
                Some(_) => self.drain(),
                None => return None,
            }
        }
    }
}

/// Owning half of a dispatch queue.
///
/// Not `Send`: it lives and dies on the thread that created it. Dropping it
/// stops queueing (later posts run inline), drains what is left, and frees the
/// role slot.
pub struct DispatchQueue {
    shared: Arc<QueueShared>,
    _not_send: PhantomData<*const ()>,
}

impl DispatchQueue {
    /// Create and register the queue for `role` on the calling thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RoleOccupied`] if `role` already has an active queue.
    pub fn new(role: Role) -> Result<Self> {
        Self::build(role, None)
    }

    /// Like [`DispatchQueue::new`], waking the owner through `waker`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RoleOccupied`] if `role` already has an active queue.
    pub fn with_waker(role: Role, waker: Arc<dyn PlatformWaker>) -> Result<Self> {
        Self::build(role, Some(waker))
    }

    fn build(role: Role, waker: Option<Arc<dyn PlatformWaker>>) -> Result<Self> {
        let shared = Arc::new(QueueShared {
            role,
            owner: thread::current().id(),
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                destroyed: false,
            }),
            wake_signal: Event::new(),
            flushed_signal: Event::with_state(true),
            waker,
        });

        {
            let mut slots = REGISTRY.lock();
            let slot = &mut slots[role.slot()];
            if slot.is_some() {
                return Err(Error::RoleOccupied(role));
            }
            *slot = Some(Arc::clone(&shared));
        }
        OWNED.with(|owned| owned.borrow_mut().push(Arc::clone(&shared)));

        debug!(role = %role, thread = ?shared.owner, "dispatch queue registered");
        Ok(Self {
            shared,
            _not_send: PhantomData,
        })
    }

    /// This queue's role.
    #[must_use]
    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// A cross-thread handle to this queue.
    #[must_use]
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Queue `callback`; see [`Dispatcher::post`].
    pub fn post<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.post(Box::new(callback), false);
    }

    /// Run everything queued, including work queued while draining.
    pub fn flush(&self) {
        self.shared.drain();
    }

    /// True when nothing is queued.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.shared.flushed_signal.is_set()
    }

    /// Block until work is posted (or `timeout` elapses), then drain it.
    ///
    /// This is the owner's event loop when no [`PlatformWaker`] is installed.
    /// Returns `false` on timeout.
    pub fn wait_for_dispatch(&self, timeout: Option<Duration>) -> bool {
        let wake = self.shared.wake_signal.handle();
        if block_any(&[wake], deadline_after(timeout)).is_some() {
            self.shared.drain();
            true
        } else {
            false
        }
    }
}

impl Drop for DispatchQueue {
    fn drop(&mut self) {
        self.shared.state.lock().destroyed = true;
        self.shared.drain();

        {
            let mut slots = REGISTRY.lock();
            let slot = &mut slots[self.shared.role.slot()];
            if slot.as_ref().is_some_and(|s| Arc::ptr_eq(s, &self.shared)) {
                *slot = None;
            }
        }
        let _ = OWNED.try_with(|owned| {
            owned
                .borrow_mut()
                .retain(|s| !Arc::ptr_eq(s, &self.shared));
        });

        debug!(role = %self.shared.role, "dispatch queue unregistered");
    }
}

impl fmt::Debug for DispatchQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchQueue")
            .field("role", &self.shared.role)
            .field("owner", &self.shared.owner)
            .field("idle", &self.is_idle())
            .finish()
    }
}

/// Cross-thread handle to a dispatch queue.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<QueueShared>,
}

impl Dispatcher {
    /// The queue's role.
    #[must_use]
    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// True on the queue's owning thread.
    #[must_use]
    pub fn is_current_thread(&self) -> bool {
        self.shared.is_current_thread()
    }

    /// Queue `callback` to run on the owning thread.
    ///
    /// After the queue is destroyed the callback runs inline instead.
    pub fn post<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.post(Box::new(callback), false);
    }

    /// Like [`Dispatcher::post`], but runs inline when already on the owner.
    pub fn post_or_run<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.post(Box::new(callback), true);
    }

    #[allow(dead_code)]
    pub(crate) fn post_job(&self, job: Job) {
        self.shared.post(job, false);
    }

    /// Drain the queue.
    ///
    /// On the owner, or with `force`, runs queued callbacks until none remain.
    /// Otherwise blocks until the owner has drained it.
    pub fn flush(&self, force: bool) {
        self.shared.flush(force);
    }

    /// Run `callback` on the owning thread and return its result.
    ///
    /// Runs inline when already on the owner. Must not be called from a thread
    /// the owner is itself blocked on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Abandoned`] if the callback panicked on the owner.
    pub fn send<R, F>(&self, callback: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        self.shared.send(callback, None)
    }

    /// [`Dispatcher::send`] with a bound on the wait.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if the owner did not run the callback in time,
    /// or [`Error::Abandoned`] if the callback panicked.
    pub fn send_timeout<R, F>(&self, callback: F, timeout: Duration) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        self.shared.send(callback, Some(timeout))
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("role", &self.shared.role)
            .field("owner", &self.shared.owner)
            .finish()
    }
}

/// Serializes tests that touch the process-wide role registry.
#[cfg(test)]
pub(crate) fn registry_test_lock() -> parking_lot::MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock()
}
