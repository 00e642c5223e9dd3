//! Cooperative cancellation.
//!
//! A [`CancelSource`] owns the right to cancel; any number of [`CancelToken`]s
//! observe it. Canceling never preempts work. It flips a shared flag, sets the
//! token's wait handle, and runs registered listeners once each, in
//! registration order, outside the internal lock.
//!
//! A default-constructed token is "no token": it is never canceled, so APIs can
//! take a `CancelToken` unconditionally.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use super::error::{Error, Result};
use super::handle::Handle;

type Listener = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct CancelState {
    listeners: Vec<(u64, Listener)>,
    next_id: u64,
    /// Created on first `wait_handle` call.
    handle: Option<Handle>,
}

#[derive(Default)]
struct CancelShared {
    canceled: AtomicBool,
    state: Mutex<CancelState>,
}

/// The canceling half of a cancellation cell.
#[derive(Clone, Default)]
pub struct CancelSource {
    shared: Arc<CancelShared>,
}

impl CancelSource {
    /// A fresh, uncanceled source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A token observing this source.
    #[must_use]
    pub fn token(&self) -> CancelToken {
        CancelToken {
            shared: Some(Arc::clone(&self.shared)),
        }
    }

    /// True once [`CancelSource::cancel`] has been called.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.shared.canceled.load(Ordering::Acquire)
    }

    /// Cancel. Idempotent.
    pub fn cancel(&self) {
        if self.is_canceled() {
            return;
        }

        let listeners = {
            let mut state = self.shared.state.lock();
            if self.shared.canceled.load(Ordering::Acquire) {
                return;
            }
            self.shared.canceled.store(true, Ordering::Release);
            if let Some(handle) = &state.handle {
                handle.set();
            }
            std::mem::take(&mut state.listeners)
        };

        trace!(listeners = listeners.len(), "cancel source canceled");
        for (_, listener) in listeners {
            listener();
        }
    }
}

impl std::fmt::Debug for CancelSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelSource")
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

/// The observing half of a cancellation cell.
#[derive(Clone, Default)]
pub struct CancelToken {
    shared: Option<Arc<CancelShared>>,
}

impl CancelToken {
    /// The "no token" token. Same as `CancelToken::default()`.
    #[must_use]
    pub const fn none() -> Self {
        Self { shared: None }
    }

    /// False for "no token".
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.shared.is_some()
    }

    /// True once the source has been canceled.
    #[must_use]
    pub fn canceled(&self) -> bool {
        self.shared
            .as_ref()
            .is_some_and(|s| s.canceled.load(Ordering::Acquire))
    }

    /// `Err(Error::Canceled)` if canceled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Canceled`] once the source has been canceled.
    pub fn check_canceled(&self) -> Result<()> {
        if self.canceled() {
            Err(Error::Canceled)
        } else {
            Ok(())
        }
    }

    /// Register a listener to run on cancellation.
    ///
    /// Runs `listener` right away if already canceled. The listener is dropped
    /// unrun for "no token". Dropping the returned connection deregisters it.
    pub fn connect<F>(&self, listener: F) -> CancelConnection
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(shared) = &self.shared else {
            return CancelConnection::default();
        };

        {
            let mut state = shared.state.lock();
            if !shared.canceled.load(Ordering::Acquire) {
                let id = state.next_id;
                state.next_id += 1;
                state.listeners.push((id, Box::new(listener)));
                return CancelConnection {
                    shared: Some(Arc::clone(shared)),
                    id,
                };
            }
        }

        listener();
        CancelConnection::default()
    }

    /// A handle that becomes set on cancellation.
    ///
    /// Already-canceled tokens return an always-set handle; "no token" returns
    /// one that never sets.
    #[must_use]
    pub fn wait_handle(&self) -> Handle {
        let Some(shared) = &self.shared else {
            return Handle::never_set();
        };
        if shared.canceled.load(Ordering::Acquire) {
            return Handle::always_set();
        }

        let mut state = shared.state.lock();
        if shared.canceled.load(Ordering::Acquire) {
            return Handle::always_set();
        }
        state.handle.get_or_insert_with(|| Handle::new(false)).clone()
    }
}

impl PartialEq for CancelToken {
    fn eq(&self, other: &Self) -> bool {
        match (&self.shared, &other.shared) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl Eq for CancelToken {}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("valid", &self.is_valid())
            .field("canceled", &self.canceled())
            .finish()
    }
}

/// A listener registration. Dropping it deregisters the listener.
#[derive(Default)]
#[must_use = "dropping the connection deregisters the listener"]
pub struct CancelConnection {
    shared: Option<Arc<CancelShared>>,
    id: u64,
}

impl CancelConnection {
    /// True if this connection still holds a registration.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.shared.is_some()
    }

    /// Deregister now.
    pub fn disconnect(&mut self) {
        if let Some(shared) = self.shared.take() {
            let removed = {
                let mut state = shared.state.lock();
                state
                    .listeners
                    .iter()
                    .position(|(id, _)| *id == self.id)
                    .map(|index| state.listeners.remove(index))
            };
            // listener captures are dropped outside the lock
            drop(removed);
        }
    }
}

impl Drop for CancelConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl std::fmt::Debug for CancelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelConnection")
            .field("connected", &self.is_connected())
            .finish()
    }
}
