//! Worker pool and scheduler configuration structures.

use serde::{Deserialize, Serialize};

/// Prefix for environment variables read by [`SchedulerConfig::from_env`].
pub const ENV_PREFIX: &str = "PROMETHEUS_DISPATCH_";

const DEFAULT_STACK_SIZE: usize = 2 * 1024 * 1024;
const MIN_STACK_SIZE: usize = 64 * 1024;

/// Which service backs the worker pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeConfig {
    /// Dedicated OS worker threads plus a timer thread.
    #[default]
    Native,
    /// A tokio runtime's blocking pool and timers.
    Tokio,
}

impl std::str::FromStr for RuntimeConfig {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "native" => Ok(Self::Native),
            "tokio" => Ok(Self::Tokio),
            other => Err(format!("unknown runtime `{other}` (expected `native` or `tokio`)")),
        }
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Number of dedicated worker threads.
    pub worker_count: usize,
    /// Stack size for each worker thread, in bytes.
    pub thread_stack_size: usize,
    /// Worker threads are named `{prefix}-{index}`.
    pub thread_name_prefix: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get().max(1),
            thread_stack_size: DEFAULT_STACK_SIZE,
            thread_name_prefix: "pd-worker".into(),
        }
    }
}

impl WorkerPoolConfig {
    /// Default configuration: one worker per logical CPU.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of worker threads.
    #[must_use]
    pub const fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Set the worker thread stack size in bytes.
    #[must_use]
    pub const fn with_thread_stack_size(mut self, size: usize) -> Self {
        self.thread_stack_size = size;
        self
    }

    /// Set the worker thread name prefix.
    #[must_use]
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Describes the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.worker_count == 0 {
            return Err("worker_count must be greater than 0".into());
        }
        if self.thread_stack_size < MIN_STACK_SIZE {
            return Err(format!(
                "thread_stack_size must be at least {MIN_STACK_SIZE} bytes"
            ));
        }
        if self.thread_name_prefix.trim().is_empty() {
            return Err("thread_name_prefix must not be empty".into());
        }
        Ok(())
    }
}

/// Root scheduler configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Worker pool settings.
    pub pool: WorkerPoolConfig,
    /// Service backing the pool.
    pub runtime: RuntimeConfig,
}

impl SchedulerConfig {
    /// Validate all sections.
    ///
    /// # Errors
    ///
    /// Describes the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        self.pool.validate().map_err(|e| format!("pool invalid: {e}"))?;
        if self.runtime == RuntimeConfig::Tokio && !cfg!(feature = "tokio-runtime") {
            return Err("runtime `tokio` requires the `tokio-runtime` feature".into());
        }
        Ok(())
    }

    /// Parse scheduler configuration from a JSON string and validate.
    ///
    /// # Errors
    ///
    /// Returns a parse or validation message.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults overridden by `PROMETHEUS_DISPATCH_*` environment variables.
    ///
    /// Loads a `.env` file first if present. Recognized variables:
    /// `WORKER_COUNT`, `THREAD_STACK_SIZE`, `THREAD_NAME_PREFIX`, `RUNTIME`.
    ///
    /// # Errors
    ///
    /// Returns a message for unparsable values or an invalid result.
    pub fn from_env() -> Result<Self, String> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// [`SchedulerConfig::from_env`] over an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns a message for unparsable values or an invalid result.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let mut cfg = Self::default();

        if let Some(count) = var("WORKER_COUNT") {
            cfg.pool.worker_count = count
                .trim()
                .parse()
                .map_err(|e| format!("{ENV_PREFIX}WORKER_COUNT: {e}"))?;
        }
        if let Some(size) = var("THREAD_STACK_SIZE") {
            cfg.pool.thread_stack_size = size
                .trim()
                .parse()
                .map_err(|e| format!("{ENV_PREFIX}THREAD_STACK_SIZE: {e}"))?;
        }
        if let Some(prefix) = var("THREAD_NAME_PREFIX") {
            cfg.pool.thread_name_prefix = prefix;
        }
        if let Some(runtime) = var("RUNTIME") {
            cfg.runtime = runtime
                .parse()
                .map_err(|e| format!("{ENV_PREFIX}RUNTIME: {e}"))?;
        }

        cfg.validate()?;
        Ok(cfg)
    }
}
