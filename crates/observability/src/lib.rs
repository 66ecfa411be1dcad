//! Tracing and logging setup shared by every binary and benchmark.

pub mod tracing;

pub use self::tracing::LogFormat;

/// Initialize process-wide logging with JSON output.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init(LogFormat::Json);
}

/// Initialize process-wide logging in the given format.
pub fn init_with(format: LogFormat) {
    tracing::init(format);
}

/// Capture logs through the test harness (`cargo test -- --nocapture` shows them).
pub fn init_for_tests() {
    tracing::init_for_tests();
}
