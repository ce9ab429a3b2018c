//! Tracing/logging setup shared by the `ledermail` binary and tests.

/// Initialize process-wide logging from `RUST_LOG` and `LOG_FORMAT`.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

pub mod tracing;

pub use crate::tracing::LogFormat;
