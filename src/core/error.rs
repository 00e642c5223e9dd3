//! Error types for dispatch, worker pool and task operations.

use std::sync::Arc;

use thiserror::Error;

use super::dispatch::Role;

/// Errors produced by scheduler components.
///
/// Cancellation, timeout and abandonment are distinct kinds so that awaiting
/// code can tell them apart from genuine faults.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The operation's cancel token was canceled.
    #[error("operation canceled")]
    Canceled,
    /// A bounded wait elapsed before its condition became true.
    #[error("wait timed out")]
    Timeout,
    /// Every producer of an async result went away before completing it.
    #[error("task abandoned before completion")]
    Abandoned,
    /// User work raised an error or panicked while producing a result.
    #[error("unhandled fault: {0}")]
    Fault(Arc<anyhow::Error>),
    /// A producer tried to complete an async result a second time.
    #[error("result already set")]
    AlreadyCompleted,
    /// A dispatch queue is already registered for this role.
    #[error("dispatch role `{0}` is already registered")]
    RoleOccupied(Role),
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The thread pool service could not be created or used.
    #[error("thread pool error: {0}")]
    Pool(String),
}

impl Error {
    /// Wrap any error as a fault.
    pub fn fault(err: impl Into<anyhow::Error>) -> Self {
        Self::Fault(Arc::new(err.into()))
    }

    /// Build a fault from a caught panic payload.
    pub(crate) fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let msg = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string());
        Self::fault(anyhow::anyhow!("task panicked: {msg}"))
    }

    /// True for [`Error::Canceled`].
    #[must_use]
    pub const fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    /// True for [`Error::Timeout`].
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
