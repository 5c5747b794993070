//! Tracing and logging setup shared by every binary.

/// Initialize process-wide logging.
///
/// The format comes from `LOG_FORMAT` (`json`, the default, or `pretty`) and
/// the filter from `RUST_LOG`. Safe to call multiple times; later calls are
/// no-ops.
pub fn init() {
    tracing::init(tracing::LogFormat::from_env());
}

/// Subscriber configuration (format, filters).
pub mod tracing;

pub use self::tracing::LogFormat;
