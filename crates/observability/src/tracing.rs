//! Tracing/logging initialization.
//!
//! JSON lines on stdout. Each line carries the current span stack, so events
//! logged inside a command worker show the `worker` index and the command
//! being processed.

use tracing_subscriber::EnvFilter;

/// Initialize tracing for the process.
///
/// `RUST_LOG` wins over `default_filter` when set. Safe to call multiple
/// times (subsequent calls are no-ops).
pub fn init(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_current_span(false)
        .with_span_list(true)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();
}
