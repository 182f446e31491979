//! Telemetry helpers for structured logging and tracing.

/// Default filter used when `RUST_LOG` is unset.
pub const DEFAULT_DIRECTIVE: &str = "prometheus_taskloader=info";

/// Initialize tracing. Users can install their own subscriber; this helper
/// installs an env-filtered fmt subscriber if none is set.
pub fn init_tracing() {
    init_tracing_with(DEFAULT_DIRECTIVE);
}

/// Initialize tracing with an explicit fallback directive used when
/// `RUST_LOG` is not present in the environment.
pub fn init_tracing_with(directive: &str) {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(directive));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init();
}
