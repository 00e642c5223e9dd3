//! # Prometheus Dispatch
//!
//! Cooperative scheduling and async-result substrate for the Prometheus AI
//! Platform's desktop runtime.
//!
//! Work moves between a fixed set of thread-affine dispatch queues (main,
//! game, frame, background task), runs on a shared background worker pool,
//! resumes from timers and waitable signals, and is observed through an async
//! result type with cooperative cancellation.
//!
//! ## Building Blocks
//!
//! - **`Handle` / `Event`**: reference-counted manual-reset signals. Blocking
//!   waits keep the calling thread's dispatch queue running.
//! - **`CancelSource` / `CancelToken`**: cooperative cancellation with
//!   listeners and a waitable handle.
//! - **`WorkerPool`**: fire-and-forget callbacks, timers and handle waits on a
//!   thread-pool service, with `flush()` to drain everything in flight.
//! - **`DispatchQueue`**: one per role, owned by one thread; any thread may post
//!   or `send` to it.
//! - **`Promise` / `Task`**: single-writer async results that can be polled,
//!   blocked on, chained, or awaited. Awaiting resumes on the awaiter's role.
//!
//! ## Example
//!
//! ```rust
//! use prometheus_dispatch::core::{task, DispatchQueue, Role};
//! use std::time::Duration;
//!
//! // this thread becomes the game thread
//! let game = DispatchQueue::new(Role::Game).unwrap();
//!
//! let result = task::spawn(async {
//!     // computed on a pool thread...
//!     let value = task::run(|| 6 * 7).await?;
//!     // ...and continued back on the game thread
//!     assert!(Role::Game.is_current());
//!     Ok::<_, prometheus_dispatch::core::Error>(value)
//! });
//!
//! // blocking waits pump the game queue, so the continuation can run
//! assert!(result.wait(Some(Duration::from_secs(5))));
//! assert_eq!(result.result().unwrap(), 42);
//! drop(game);
//! ```
//!
//! ## Configuration
//!
//! The global pool reads `PROMETHEUS_DISPATCH_*` environment variables (and a
//! `.env` file) on first use; see [`config::SchedulerConfig::from_env`]. Hosts
//! that want explicit control build a pool with
//! [`builders::build_worker_pool`] and install it with
//! [`core::worker_pool::install_global`].

#![deny(warnings)]
#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Core scheduling primitives.
pub mod core;
/// Configuration models for the worker pool and its runtime.
pub mod config;
/// Builders to construct scheduler components from configuration.
pub mod builders;
/// Runtime adapters that back the worker pool with other executors.
pub mod runtime;
/// Shared utilities.
pub mod util;

pub use crate::core::{
    CancelSource, CancelToken, DispatchQueue, Error, Event, Handle, Promise, Result, Role, Task,
    WorkerPool,
};
