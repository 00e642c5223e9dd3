//! Awaitables for delays, yields, role hops and handle waits.
//!
//! Each of these suspends the awaiting computation and resumes it on a chosen
//! [`Role`]: the caller's own role by default. Thread-bound roles (main, game,
//! frame) resume through their dispatch queue; [`Role::Task`] resumes on the
//! global worker pool.
//!
//! ```no_run
//! use prometheus_dispatch::core::{awaiters, task, CancelToken, Error, Role};
//! use std::time::Duration;
//!
//! let work = task::spawn(async {
//!     awaiters::resume_on_task().await?;
//!     // now on a pool thread
//!     awaiters::delay(Duration::from_millis(10), &CancelToken::none(), None).await?;
//!     awaiters::resume_on(Role::Main).await?;
//!     Ok::<_, Error>(42)
//! });
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use parking_lot::Mutex;

use super::cancel::CancelToken;
use super::dispatch::{self, Role};
use super::error::{Error, Result};
use super::handle::Handle;
use super::worker_pool;

/// One-shot resume signal shared between a suspended awaitable and whatever
/// will resume it.
#[derive(Default)]
pub(crate) struct Resume {
    fired: AtomicBool,
    /// Payload recorded at fire time (handle waits: "was signaled").
    value: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

impl Resume {
    pub(crate) fn new(waker: &Waker) -> Arc<Self> {
        Arc::new(Self {
            waker: Mutex::new(Some(waker.clone())),
            ..Self::default()
        })
    }

    pub(crate) fn fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    pub(crate) fn value(&self) -> bool {
        self.value.load(Ordering::Acquire)
    }

    /// Replace the waker to notify. Call before checking [`Resume::fired`].
    pub(crate) fn update(&self, waker: &Waker) {
        let mut slot = self.waker.lock();
        if !slot.as_ref().is_some_and(|w| w.will_wake(waker)) {
            *slot = Some(waker.clone());
        }
    }

    pub(crate) fn fire(&self, value: bool) {
        self.value.store(value, Ordering::Release);
        self.fired.store(true, Ordering::Release);
        let waker = self.waker.lock().take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// Run `job` as `role`, always via a hop.
///
/// Thread-bound roles go through their dispatch queue (inline if the role has
/// no active queue); [`Role::Task`] goes to the global worker pool.
pub(crate) fn post_to_role<F>(role: Role, job: F)
where
    F: FnOnce() + Send + 'static,
{
    if role.is_thread_bound() {
        dispatch::post(role, job);
    } else {
        worker_pool::global().add_task(job);
    }
}

/// Fire `resume` as `role`: inline when already on a background thread,
/// otherwise via [`post_to_role`].
pub(crate) fn resume_as(role: Role, resume: Arc<Resume>, value: bool) {
    if !role.is_thread_bound() && role.is_current() {
        resume.fire(value);
    } else {
        post_to_role(role, move || resume.fire(value));
    }
}

/// Suspends for a duration (or just hops), then resumes on a role.
///
/// Resolves to `Err(Error::Canceled)` if the token was canceled by the time it
/// resumes.
#[must_use = "futures do nothing unless awaited"]
pub struct Delay {
    /// `None`: hop only, completing immediately if already on the role.
    duration: Option<Duration>,
    token: CancelToken,
    role: Option<Role>,
    resume: Option<Arc<Resume>>,
}

impl Delay {
    fn new(duration: Option<Duration>, token: CancelToken, role: Option<Role>) -> Self {
        Self {
            duration,
            token,
            role,
            resume: None,
        }
    }
}

impl Future for Delay {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let role = *this.role.get_or_insert_with(Role::current);

        if let Some(resume) = &this.resume {
            resume.update(cx.waker());
            return if resume.fired() {
                Poll::Ready(this.token.check_canceled())
            } else {
                Poll::Pending
            };
        }

        if this.duration.is_none() && role.is_current() {
            return Poll::Ready(this.token.check_canceled());
        }

        let resume = Resume::new(cx.waker());
        match this.duration {
            None | Some(Duration::ZERO) => {
                let r = Arc::clone(&resume);
                post_to_role(role, move || r.fire(true));
            }
            Some(duration) => {
                let r = Arc::clone(&resume);
                worker_pool::global().arm_timer(
                    move |_canceled| resume_as(role, r, true),
                    duration,
                    &this.token,
                );
            }
        }
        this.resume = Some(resume);
        Poll::Pending
    }
}

impl std::fmt::Debug for Delay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delay")
            .field("duration", &self.duration)
            .field("role", &self.role)
            .field("suspended", &self.resume.is_some())
            .finish()
    }
}

/// Suspend for `duration`, then resume on `role` (`None`: the caller's role).
///
/// Canceling `token` resumes early with `Err(Error::Canceled)`.
pub fn delay(duration: Duration, token: &CancelToken, role: Option<Role>) -> Delay {
    Delay::new(Some(duration), token.clone(), role)
}

/// Always suspend, letting queued work run, then resume on `role`.
pub fn yield_now(role: Option<Role>) -> Delay {
    Delay::new(Some(Duration::ZERO), CancelToken::none(), role)
}

/// Continue on `role`. Completes immediately if already there.
pub fn resume_on(role: Role) -> Delay {
    Delay::new(None, CancelToken::none(), Some(role))
}

/// Continue on the main thread.
pub fn resume_on_main() -> Delay {
    resume_on(Role::Main)
}

/// Continue on the game thread.
pub fn resume_on_game() -> Delay {
    resume_on(Role::Game)
}

/// Continue on a background pool thread.
pub fn resume_on_task() -> Delay {
    resume_on(Role::Task)
}

/// Awaits a [`Handle`], with an optional timeout.
///
/// Resolves to `Ok(())` once set, or `Err(Error::Timeout)` if the timeout
/// elapses first.
#[must_use = "futures do nothing unless awaited"]
pub struct HandleWait {
    handle: Handle,
    timeout: Option<Duration>,
    role: Option<Role>,
    resume: Option<Arc<Resume>>,
}

impl HandleWait {
    /// Wait for `handle`, resuming on `role` (`None`: the caller's role).
    pub fn new(handle: Handle, timeout: Option<Duration>, role: Option<Role>) -> Self {
        Self {
            handle,
            timeout,
            role,
            resume: None,
        }
    }
}

impl Future for HandleWait {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let role = *this.role.get_or_insert_with(Role::current);

        if let Some(resume) = &this.resume {
            resume.update(cx.waker());
            return match (resume.fired(), resume.value()) {
                (false, _) => Poll::Pending,
                (true, true) => Poll::Ready(Ok(())),
                (true, false) => Poll::Ready(Err(Error::Timeout)),
            };
        }

        if this.handle.is_set() && role.is_current() {
            return Poll::Ready(Ok(()));
        }
        if this.timeout == Some(Duration::ZERO) && !this.handle.is_set() {
            return Poll::Ready(Err(Error::Timeout));
        }

        let resume = Resume::new(cx.waker());
        let (r, h) = (Arc::clone(&resume), this.handle.clone());
        worker_pool::global().add_wait(
            move || {
                let signaled = h.is_set();
                resume_as(role, r, signaled);
            },
            &this.handle,
            this.timeout,
        );
        this.resume = Some(resume);
        Poll::Pending
    }
}

impl std::fmt::Debug for HandleWait {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleWait")
            .field("handle", &self.handle)
            .field("timeout", &self.timeout)
            .field("role", &self.role)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cancel::CancelSource;
    use futures::executor::block_on;
    use std::time::Instant;

    #[test]
    fn test_resume_fires_once_with_value() {
        let resume = Arc::new(Resume::default());
        assert!(!resume.fired());
        resume.fire(true);
        assert!(resume.fired());
        assert!(resume.value());
    }

    #[test]
    fn test_delay_waits() {
        let start = Instant::now();
        let result = block_on(delay(Duration::from_millis(20), &CancelToken::none(), None));
        assert!(result.is_ok());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_delay_canceled_early() {
        let source = CancelSource::new();
        let token = source.token();
        let remote = source.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            remote.cancel();
        });
        let start = Instant::now();
        let result = block_on(delay(Duration::from_secs(60), &token, None));
        assert!(matches!(result, Err(Error::Canceled)));
        assert!(start.elapsed() < Duration::from_secs(30));
    }

    #[test]
    fn test_handle_wait_ok_and_timeout() {
        let handle = Handle::new(false);
        let remote = handle.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            remote.set();
        });
        assert!(block_on(handle.wait_async(Some(Duration::from_secs(5)))).is_ok());

        let never = Handle::new(false);
        let result = block_on(never.wait_async(Some(Duration::from_millis(10))));
        assert!(matches!(result, Err(Error::Timeout)));
    }

    #[test]
    fn test_zero_timeout_handle_wait_is_immediate() {
        let handle = Handle::new(false);
        let result = block_on(HandleWait::new(handle, Some(Duration::ZERO), None));
        assert!(matches!(result, Err(Error::Timeout)));
    }

    #[test]
    fn test_resume_on_task_when_already_there() {
        assert!(block_on(resume_on_task()).is_ok());
    }
}
