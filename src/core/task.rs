//! Async results: a single-writer completion cell with a producer half
//! ([`Promise`]) and a consumer half ([`Task`]).
//!
//! A `Task` can be polled ([`Task::done`]), blocked on ([`Task::wait`],
//! [`Task::result`]), chained ([`Task::continue_with`]) or awaited. Awaiting
//! always resumes on the role the awaiter was running as: a computation
//! suspended on the game thread comes back on the game thread even when the
//! result is produced on a pool thread.
//!
//! When every `Promise` is dropped without completing, the cell is
//! *abandoned*: pending continuations run with `resume = false`, blocked
//! waiters wake, and awaiters get [`Error::Abandoned`].
//!
//! # Examples
//!
//! ```
//! use prometheus_dispatch::core::task;
//!
//! let answer = task::run(|| 6 * 7);
//! let doubled = answer.continue_with(|result| result.map(|v| v * 2));
//! assert_eq!(doubled.result().unwrap().unwrap(), 84);
//! ```

use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

use super::awaiters::{resume_as, Resume};
use super::dispatch::Role;
use super::error::{AppResult, Error, Result};
use super::handle::Handle;
use super::worker_pool;

/// Runs once when the cell settles; `true` means completed, `false` abandoned.
type Continuation = Box<dyn FnOnce(bool) + Send + 'static>;

enum Outcome<T> {
    Pending,
    Complete(Result<T>),
    Abandoned,
}

struct CellState<T> {
    outcome: Outcome<T>,
    continuations: Vec<Continuation>,
    /// Created on first blocking wait.
    done_signal: Option<Handle>,
}

struct Cell<T> {
    state: Mutex<CellState<T>>,
    producers: AtomicUsize,
}

impl<T> Cell<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(CellState {
                outcome: Outcome::Pending,
                continuations: Vec::new(),
                done_signal: None,
            }),
            producers: AtomicUsize::new(1),
        }
    }

    fn settle(&self, outcome: Outcome<T>) -> Result<()> {
        let completed = matches!(outcome, Outcome::Complete(_));
        let (continuations, signal) = {
            let mut state = self.state.lock();
            if !matches!(state.outcome, Outcome::Pending) {
                return Err(Error::AlreadyCompleted);
            }
            state.outcome = outcome;
            (
                std::mem::take(&mut state.continuations),
                state.done_signal.take(),
            )
        };

        if let Some(signal) = signal {
            signal.set();
        }
        for continuation in continuations {
            continuation(completed);
        }
        Ok(())
    }

    fn complete(&self, result: Result<T>) -> Result<()> {
        let outcome = self.settle(Outcome::Complete(result));
        debug_assert!(outcome.is_ok(), "async result completed twice");
        outcome
    }

    fn abandon(&self) {
        if self.settle(Outcome::Abandoned).is_ok() {
            trace!("async result abandoned");
        }
    }

    /// Run `continuation` on settle, or right away if already settled.
    fn on_settled(&self, continuation: Continuation) {
        let completed = {
            let mut state = self.state.lock();
            match state.outcome {
                Outcome::Pending => {
                    state.continuations.push(continuation);
                    return;
                }
                Outcome::Complete(_) => true,
                Outcome::Abandoned => false,
            }
        };
        continuation(completed);
    }

    fn done_handle(&self) -> Handle {
        let mut state = self.state.lock();
        match state.outcome {
            Outcome::Pending => state
                .done_signal
                .get_or_insert_with(|| Handle::new(false))
                .clone(),
            Outcome::Complete(_) | Outcome::Abandoned => Handle::always_set(),
        }
    }

    fn is_done(&self) -> bool {
        matches!(self.state.lock().outcome, Outcome::Complete(_))
    }

    fn is_abandoned(&self) -> bool {
        matches!(self.state.lock().outcome, Outcome::Abandoned)
    }
}

impl<T: Clone> Cell<T> {
    fn peek(&self) -> Option<Result<T>> {
        match &self.state.lock().outcome {
            Outcome::Pending => None,
            Outcome::Complete(result) => Some(result.clone()),
            Outcome::Abandoned => Some(Err(Error::Abandoned)),
        }
    }
}

/// Producer half of an async result.
///
/// Clones are additional producers. The cell is abandoned when the last one is
/// dropped without completing it.
pub struct Promise<T> {
    cell: Arc<Cell<T>>,
}

impl<T> Promise<T> {
    /// A fresh, pending result.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cell: Arc::new(Cell::new()),
        }
    }

    /// A consumer of this result.
    #[must_use]
    pub fn task(&self) -> Task<T> {
        Task::from_cell(Arc::clone(&self.cell))
    }

    /// Complete with a value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyCompleted`] if already completed (debug builds
    /// assert instead).
    pub fn set_result(&self, value: T) -> Result<()> {
        self.cell.complete(Ok(value))
    }

    /// Complete with an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyCompleted`] if already completed (debug builds
    /// assert instead).
    pub fn set_error(&self, error: Error) -> Result<()> {
        self.cell.complete(Err(error))
    }

    /// Complete with either outcome.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyCompleted`] if already completed (debug builds
    /// assert instead).
    pub fn complete(&self, result: Result<T>) -> Result<()> {
        self.cell.complete(result)
    }

    /// True once completed.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.cell.is_done()
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        self.cell.producers.fetch_add(1, Ordering::AcqRel);
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if self.cell.producers.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.cell.abandon();
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("done", &self.is_done())
            .finish()
    }
}

/// Consumer half of an async result.
///
/// Clones observe the same result; each clone awaits independently.
pub struct Task<T> {
    cell: Arc<Cell<T>>,
    /// Role captured on first poll.
    role: Option<Role>,
    resume: Option<Arc<Resume>>,
}

impl<T> Task<T> {
    fn from_cell(cell: Arc<Cell<T>>) -> Self {
        Self {
            cell,
            role: None,
            resume: None,
        }
    }

    /// An already-completed task.
    #[must_use]
    pub fn from_result(value: T) -> Self {
        let promise = Promise::new();
        let task = promise.task();
        let _ = promise.set_result(value);
        task
    }

    /// An already-failed task.
    #[must_use]
    pub fn from_error(error: Error) -> Self {
        let promise = Promise::new();
        let task = promise.task();
        let _ = promise.set_error(error);
        task
    }

    /// True once completed with a value or error.
    #[must_use]
    pub fn done(&self) -> bool {
        self.cell.is_done()
    }

    /// True if every producer went away without completing.
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.cell.is_abandoned()
    }

    /// A handle that becomes set when the result settles.
    #[must_use]
    pub fn done_handle(&self) -> Handle {
        self.cell.done_handle()
    }

    /// Block until the result settles. Returns `false` on timeout.
    ///
    /// The calling thread's dispatch queue keeps running while blocked.
    #[must_use = "a `false` return means the wait timed out"]
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        self.cell.done_handle().wait(timeout)
    }
}

impl<T: Clone> Task<T> {
    /// Block until settled, then return the value or the stored error.
    ///
    /// # Errors
    ///
    /// The error the producer stored, or [`Error::Abandoned`].
    pub fn result(&self) -> Result<T> {
        let _ = self.wait(None);
        self.cell.peek().unwrap_or(Err(Error::Abandoned))
    }

    /// The result if already settled.
    #[must_use]
    pub fn try_result(&self) -> Option<Result<T>> {
        self.cell.peek()
    }
}

impl<T: Clone + Send + 'static> Task<T> {
    /// Run `handler` with this task's result once it settles, as a new task.
    ///
    /// The handler runs on the calling role. An abandoned source abandons the
    /// returned task too.
    pub fn continue_with<U, F>(&self, handler: F) -> Task<U>
    where
        U: Send + 'static,
        F: FnOnce(Result<T>) -> U + Send + 'static,
    {
        let source = self.clone();
        spawn(async move {
            match source.await {
                Err(Error::Abandoned) => Err(Error::Abandoned),
                result => Ok(handler(result)),
            }
        })
    }
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self::from_cell(Arc::clone(&self.cell))
    }
}

impl<T: Clone> Future for Task<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let role = *this.role.get_or_insert_with(Role::current);

        if let Some(resume) = &this.resume {
            resume.update(cx.waker());
            if !resume.fired() {
                return Poll::Pending;
            }
            // resumed through the role; foreign executors may poll elsewhere
            return Poll::Ready(this.cell.peek().unwrap_or(Err(Error::Abandoned)));
        }

        if role.is_current() {
            if let Some(result) = this.cell.peek() {
                return Poll::Ready(result);
            }
        }

        let resume = Resume::new(cx.waker());
        this.resume = Some(Arc::clone(&resume));
        this.cell
            .on_settled(Box::new(move |completed| resume_as(role, resume, completed)));
        Poll::Pending
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("done", &self.done())
            .field("abandoned", &self.is_abandoned())
            .finish()
    }
}

const IDLE: u8 = 0;
const POLLING: u8 = 1;
const NOTIFIED: u8 = 2;
const FINISHED: u8 = 3;

type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'static>>;

/// A spawned computation. Its waker polls it inline on the waking thread.
struct Coroutine<T> {
    future: Mutex<Option<BoxFuture<T>>>,
    promise: Mutex<Option<Promise<T>>>,
    state: AtomicU8,
}

impl<T: Send + 'static> Coroutine<T> {
    fn run(self: &Arc<Self>) {
        // claim the poll, or leave a note for whoever holds it
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let next = match current {
                IDLE => POLLING,
                POLLING => NOTIFIED,
                _ => return,
            };
            match self
                .state
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) if next == POLLING => break,
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }

        let waker = Waker::from(Arc::clone(self));
        let mut cx = Context::from_waker(&waker);
        loop {
            let mut slot = self.future.lock();
            let Some(future) = slot.as_mut() else {
                return;
            };

            let polled = catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)));
            let output = match polled {
                Ok(Poll::Pending) => {
                    drop(slot);
                    if self
                        .state
                        .compare_exchange(POLLING, IDLE, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return;
                    }
                    // woken while polling
                    self.state.store(POLLING, Ordering::Release);
                    continue;
                }
                Ok(Poll::Ready(output)) => output,
                Err(payload) => Err(Error::from_panic(payload.as_ref())),
            };

            self.state.store(FINISHED, Ordering::Release);
            let finished = slot.take();
            drop(slot);
            drop(finished);
            self.finish(output);
            return;
        }
    }

    fn finish(&self, output: Result<T>) {
        let Some(promise) = self.promise.lock().take() else {
            return;
        };
        match output {
            // dropping the promise abandons our own result
            Err(Error::Abandoned) => drop(promise),
            output => {
                let _ = promise.complete(output);
            }
        }
    }
}

impl<T: Send + 'static> Wake for Coroutine<T> {
    fn wake(self: Arc<Self>) {
        self.run();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.run();
    }
}

/// Start `future` on the calling thread and return its result as a task.
///
/// The computation runs until its first suspension before `spawn` returns,
/// and is resumed by whatever completes the thing it awaits. A panic becomes
/// [`Error::Fault`]. Finishing with `Err(Error::Abandoned)` abandons the
/// returned task.
pub fn spawn<T, F>(future: F) -> Task<T>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    let promise = Promise::new();
    let task = promise.task();
    let coroutine = Arc::new(Coroutine {
        future: Mutex::new(Some(Box::pin(future))),
        promise: Mutex::new(Some(promise)),
        state: AtomicU8::new(IDLE),
    });
    coroutine.run();
    task
}

/// Run `work` on the global worker pool; a panic becomes [`Error::Fault`].
pub fn run<T, F>(work: F) -> Task<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    try_run(move || Ok(work()))
}

/// Run fallible `work` on the global worker pool.
///
/// An error that is already an [`Error`] is stored as-is; anything else (and
/// any panic) is stored as [`Error::Fault`].
pub fn try_run<T, F>(work: F) -> Task<T>
where
    T: Send + 'static,
    F: FnOnce() -> AppResult<T> + Send + 'static,
{
    let promise = Promise::new();
    let task = promise.task();
    worker_pool::global().add_task(move || {
        let result = match catch_unwind(AssertUnwindSafe(work)) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(err.downcast::<Error>().unwrap_or_else(Error::fault)),
            Err(payload) => Err(Error::from_panic(payload.as_ref())),
        };
        let _ = promise.complete(result);
    });
    task
}
