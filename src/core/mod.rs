//! Core scheduling primitives: handles, cancellation, the worker pool,
//! dispatch queues, async results and awaitables.

pub mod awaiters;
pub mod cancel;
pub mod dispatch;
pub mod error;
pub mod handle;
pub mod task;
pub mod worker_pool;

pub use awaiters::{
    delay, resume_on, resume_on_game, resume_on_main, resume_on_task, yield_now, Delay, HandleWait,
};
pub use cancel::{CancelConnection, CancelSource, CancelToken};
pub use dispatch::{Dispatcher, DispatchQueue, PlatformWaker, Role};
pub use error::{AppResult, Error, Result};
pub use handle::{wait_all, wait_any, wait_any_with, Event, Handle};
pub use task::{Promise, Task};
pub use worker_pool::{
    InlineService, Job, NativePoolService, PoolService, PoolStats, TimerId, WorkerPool,
};
