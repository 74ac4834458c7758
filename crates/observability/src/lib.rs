//! Tracing and logging setup shared by every provenance binary and test harness.

/// Initialize process-wide tracing.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use tracing::{LOG_FORMAT_ENV, LogFormat, init_with};
