//! Waitable synchronization handles.
//!
//! A [`Handle`] is a reference-counted manual-reset signal. Clones (or
//! [`Handle::duplicate`]) refer to the same signal, so a handle can be handed to
//! another thread, polled with [`Handle::is_set`], blocked on with
//! [`Handle::wait`], or awaited with [`Handle::wait_async`].
//!
//! Blocking waits cooperate with the calling thread's dispatch queue: while a
//! queue owner is blocked, callbacks posted to its queue still run. See
//! [`wait_any`] for details.
//!
//! # Examples
//!
//! ```
//! use prometheus_dispatch::core::Handle;
//! use std::time::Duration;
//!
//! let handle = Handle::new(false);
//! let remote = handle.duplicate();
//!
//! std::thread::spawn(move || remote.set());
//! assert!(handle.wait(Some(Duration::from_secs(5))));
//! assert!(handle.is_set());
//! ```

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::awaiters::HandleWait;
use super::dispatch;

/// Something that wants to hear about a signal becoming set.
///
/// Implementations must not block: `notify` runs on whatever thread called
/// [`Handle::set`].
pub(crate) trait Notify: Send + Sync {
    fn notify(&self);
}

struct SignalState {
    set: bool,
    watchers: Vec<Arc<dyn Notify>>,
}

struct Signal {
    state: Mutex<SignalState>,
    /// Fixed signals ignore `set`/`reset` (shared never/always handles).
    fixed: bool,
}

/// A reference-counted, manual-reset waitable signal.
#[derive(Clone)]
pub struct Handle {
    signal: Arc<Signal>,
}

impl Handle {
    /// Create a new signal, initially set or unset.
    #[must_use]
    pub fn new(initial_set: bool) -> Self {
        Self::build(initial_set, false)
    }

    fn build(initial_set: bool, fixed: bool) -> Self {
        Self {
            signal: Arc::new(Signal {
                state: Mutex::new(SignalState {
                    set: initial_set,
                    watchers: Vec::new(),
                }),
                fixed,
            }),
        }
    }

    /// A shared handle that never becomes set.
    #[must_use]
    pub fn never_set() -> Self {
        static NEVER: OnceLock<Handle> = OnceLock::new();
        NEVER.get_or_init(|| Self::build(false, true)).clone()
    }

    /// A shared handle that is always set.
    #[must_use]
    pub fn always_set() -> Self {
        static ALWAYS: OnceLock<Handle> = OnceLock::new();
        ALWAYS.get_or_init(|| Self::build(true, true)).clone()
    }

    /// Another owning reference to the same signal.
    #[must_use]
    pub fn duplicate(&self) -> Self {
        self.clone()
    }

    /// True if both handles refer to the same signal.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.signal, &other.signal)
    }

    /// Non-blocking poll.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.signal.state.lock().set
    }

    /// Set the signal and wake everything waiting on it.
    pub fn set(&self) {
        if self.signal.fixed {
            return;
        }

        let watchers = {
            let mut state = self.signal.state.lock();
            if state.set {
                return;
            }
            state.set = true;
            state.watchers.clone()
        };

        for watcher in watchers {
            watcher.notify();
        }
    }

    /// Clear the signal.
    pub fn reset(&self) {
        if !self.signal.fixed {
            self.signal.state.lock().set = false;
        }
    }

    /// Block until the signal is set or the timeout elapses.
    ///
    /// `None` waits forever. Returns `false` on timeout. The calling thread's
    /// dispatch queue keeps running while blocked.
    #[must_use = "a `false` return means the wait timed out"]
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        self.wait_with(timeout, true)
    }

    /// Like [`Handle::wait`], optionally without pumping the dispatch queue.
    #[must_use = "a `false` return means the wait timed out"]
    pub fn wait_with(&self, timeout: Option<Duration>, allow_dispatch: bool) -> bool {
        wait_any_with(&[self], timeout, allow_dispatch).is_some()
    }

    /// Await the signal from a resumable computation.
    ///
    /// Resolves to `Err(Error::Timeout)` if `timeout` elapses first.
    #[must_use]
    pub fn wait_async(&self, timeout: Option<Duration>) -> HandleWait {
        HandleWait::new(self.clone(), timeout, None)
    }

    /// Register a watcher. Returns whether the signal was already set.
    pub(crate) fn watch(&self, watcher: &Arc<dyn Notify>) -> bool {
        let mut state = self.signal.state.lock();
        state.watchers.push(Arc::clone(watcher));
        state.set
    }

    pub(crate) fn unwatch(&self, watcher: &Arc<dyn Notify>) {
        let target = Arc::as_ptr(watcher).cast::<()>();
        self.signal
            .state
            .lock()
            .watchers
            .retain(|w| Arc::as_ptr(w).cast::<()>() != target);
    }
}

impl Default for Handle {
    /// An unset handle.
    fn default() -> Self {
        Self::new(false)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("set", &self.is_set())
            .field("fixed", &self.signal.fixed)
            .finish()
    }
}

/// Manual-reset event with shared ownership.
///
/// Every clone observes and controls the same signal.
#[derive(Clone, Debug, Default)]
pub struct Event {
    handle: Handle,
}

impl Event {
    /// An unset event.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// An event with the given initial state.
    #[must_use]
    pub fn with_state(set: bool) -> Self {
        Self {
            handle: Handle::new(set),
        }
    }

    /// Set the event.
    pub fn set(&self) {
        self.handle.set();
    }

    /// Clear the event.
    pub fn reset(&self) {
        self.handle.reset();
    }

    /// Non-blocking poll.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.handle.is_set()
    }

    /// Block until set; see [`Handle::wait`].
    #[must_use = "a `false` return means the wait timed out"]
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        self.handle.wait(timeout)
    }

    /// Wait, then reset the event if the wait succeeded.
    #[must_use = "a `false` return means the wait timed out"]
    pub fn wait_and_reset(&self, timeout: Option<Duration>) -> bool {
        if self.handle.wait(timeout) {
            self.handle.reset();
            true
        } else {
            false
        }
    }

    /// The underlying handle.
    #[must_use]
    pub const fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Number of owners sharing this event's signal.
    #[must_use]
    pub fn owners(&self) -> usize {
        Arc::strong_count(&self.handle.signal)
    }
}

impl From<Event> for Handle {
    fn from(event: Event) -> Self {
        event.handle
    }
}

impl AsRef<Handle> for Event {
    fn as_ref(&self) -> &Handle {
        &self.handle
    }
}

/// Per-wait parking spot registered on every handle being waited on.
#[derive(Default)]
struct Parker {
    notified: Mutex<bool>,
    cond: Condvar,
}

impl Notify for Parker {
    fn notify(&self) {
        *self.notified.lock() = true;
        self.cond.notify_one();
    }
}

pub(crate) fn deadline_after(timeout: Option<Duration>) -> Option<Instant> {
    timeout.and_then(|t| Instant::now().checked_add(t))
}

fn first_set(handles: &[&Handle]) -> Option<usize> {
    handles.iter().position(|h| h.is_set())
}

/// Block the thread until one of `handles` is set or `deadline` passes.
///
/// Does not pump any dispatch queue.
pub(crate) fn block_any(handles: &[&Handle], deadline: Option<Instant>) -> Option<usize> {
    if let Some(index) = first_set(handles) {
        return Some(index);
    }
    if deadline.is_some_and(|d| d <= Instant::now()) {
        return None;
    }

    let parker = Arc::new(Parker::default());
    let watcher: Arc<dyn Notify> = parker.clone();
    for handle in handles {
        handle.watch(&watcher);
    }

    let result = loop {
        if let Some(index) = first_set(handles) {
            break Some(index);
        }

        let mut notified = parker.notified.lock();
        if !*notified {
            match deadline {
                None => parker.cond.wait(&mut notified),
                Some(deadline) => {
                    let timed_out = parker.cond.wait_until(&mut notified, deadline).timed_out();
                    if timed_out && !*notified {
                        drop(notified);
                        break first_set(handles);
                    }
                }
            }
        }
        *notified = false;
    };

    for handle in handles {
        handle.unwatch(&watcher);
    }
    result
}

/// Wait until any handle is set. Returns its index, or `None` on timeout.
///
/// If the calling thread owns a dispatch queue and the timeout is non-zero,
/// the queue's wake signal joins the wait set; whenever it fires the queue is
/// drained and the wait continues. This is what keeps a blocked owner from
/// deadlocking against work posted to its own thread.
#[must_use]
pub fn wait_any(handles: &[&Handle], timeout: Option<Duration>) -> Option<usize> {
    wait_any_with(handles, timeout, true)
}

/// [`wait_any`] with explicit control over queue pumping.
#[must_use]
pub fn wait_any_with(
    handles: &[&Handle],
    timeout: Option<Duration>,
    allow_dispatch: bool,
) -> Option<usize> {
    let deadline = deadline_after(timeout);
    if allow_dispatch && timeout != Some(Duration::ZERO) {
        if let Some(queue) = dispatch::current_owned_queue() {
            return queue.wait_any_pumping(handles, deadline);
        }
    }
    block_any(handles, deadline)
}

/// Wait until every handle is set. Returns `false` on timeout.
#[must_use]
pub fn wait_all(handles: &[&Handle], timeout: Option<Duration>) -> bool {
    let deadline = deadline_after(timeout);
    let mut remaining: Vec<&Handle> = handles.to_vec();

    while !remaining.is_empty() {
        let left = match deadline {
            Some(deadline) => Some(deadline.saturating_duration_since(Instant::now())),
            None if timeout.is_some() => Some(Duration::MAX),
            None => None,
        };
        match wait_any(&remaining, left) {
            Some(index) => {
                remaining.swap_remove(index);
            }
            None => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_set_reset() {
        let handle = Handle::new(false);
        assert!(!handle.is_set());
        handle.set();
        assert!(handle.is_set());
        handle.reset();
        assert!(!handle.is_set());
    }

    #[test]
    fn test_duplicate_shares_signal() {
        let handle = Handle::new(false);
        let dup = handle.duplicate();
        assert!(handle.ptr_eq(&dup));
        dup.set();
        assert!(handle.is_set());
    }

    #[test]
    fn test_fixed_handles_ignore_changes() {
        let never = Handle::never_set();
        never.set();
        assert!(!never.is_set());

        let always = Handle::always_set();
        always.reset();
        assert!(always.is_set());
        assert!(always.wait(Some(Duration::ZERO)));
    }

    #[test]
    fn test_wait_times_out() {
        let handle = Handle::new(false);
        let start = Instant::now();
        assert!(!handle.wait_with(Some(Duration::from_millis(30)), false));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_wait_wakes_on_set() {
        let handle = Handle::new(false);
        let remote = handle.duplicate();
        let setter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            remote.set();
        });
        assert!(handle.wait(None));
        setter.join().unwrap();
    }

    #[test]
    fn test_wait_any_returns_index() {
        let a = Handle::new(false);
        let b = Handle::new(false);
        let b2 = b.duplicate();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            b2.set();
        });
        assert_eq!(wait_any(&[&a, &b], Some(Duration::from_secs(5))), Some(1));
    }

    #[test]
    fn test_wait_all() {
        let handles: Vec<Handle> = (0..3).map(|_| Handle::new(false)).collect();
        for handle in &handles {
            let h = handle.duplicate();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(5));
                h.set();
            });
        }
        let refs: Vec<&Handle> = handles.iter().collect();
        assert!(wait_all(&refs, Some(Duration::from_secs(5))));
    }

    #[test]
    fn test_wait_all_times_out() {
        let a = Handle::new(true);
        let b = Handle::new(false);
        assert!(!wait_all(&[&a, &b], Some(Duration::from_millis(20))));
    }

    #[test]
    fn test_watchers_are_removed_after_wait() {
        let handle = Handle::new(false);
        assert!(!handle.wait_with(Some(Duration::from_millis(1)), false));
        assert!(handle.signal.state.lock().watchers.is_empty());
    }

    #[test]
    fn test_notify_runs_on_set() {
        struct Counter(AtomicUsize);
        impl Notify for Counter {
            fn notify(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let handle = Handle::new(false);
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let watcher: Arc<dyn Notify> = counter.clone();
        assert!(!handle.watch(&watcher));
        handle.set();
        handle.set();
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        handle.unwatch(&watcher);
    }

    #[test]
    fn test_event_wait_and_reset() {
        let event = Event::with_state(true);
        let other = event.clone();
        assert_eq!(event.owners(), 2);
        assert!(other.wait_and_reset(Some(Duration::ZERO)));
        assert!(!event.is_set());
        assert!(!event.wait_and_reset(Some(Duration::ZERO)));
    }
}
