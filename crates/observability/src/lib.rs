//! Process-wide tracing setup.
//!
//! Library crates only emit `tracing` events and spans; the binary installs
//! the subscriber once, at startup.

/// Initialize process-wide tracing with the default filter (`info`).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init("info");
}

/// Tracing configuration (filters, layers).
pub mod tracing;
