//! Telemetry helpers for structured logging and tracing.
//!
//! Pool threads are named (`pd-worker-0`, `pd-worker-timer`, ...), so the
//! default subscriber prints thread names: most scheduler events only make
//! sense next to the thread that emitted them.

use tracing_subscriber::EnvFilter;

/// Directive used when `RUST_LOG` is unset.
pub const DEFAULT_DIRECTIVE: &str = "prometheus_dispatch=info";

/// Install a default subscriber filtered by `RUST_LOG`.
///
/// Users can install their own subscriber; this does nothing if one is set.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));
    install(filter);
}

/// Install a default subscriber with an explicit filter directive, such as
/// `"prometheus_dispatch=trace"`. Ignores `RUST_LOG`.
pub fn init_tracing_with(directive: &str) {
    install(EnvFilter::new(directive));
}

fn install(filter: EnvFilter) {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init();
}
