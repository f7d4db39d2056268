//! Logging macros and subscriber setup.
//!
//! Library code logs through `log_info!` and friends so every message carries
//! the same target; only the binary installs a subscriber.

use tracing_subscriber::EnvFilter;

pub const LOG_TARGET: &str = "deskline_client";

/// Install a formatting subscriber. `RUST_LOG` wins over `default_filter`.
pub fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    // A second init (tests, embedding apps) keeps the existing subscriber.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

pub fn log_info_impl(msg: &str) {
    tracing::info!(target: LOG_TARGET, "{}", msg);
}

pub fn log_error_impl(msg: &str) {
    tracing::error!(target: LOG_TARGET, "{}", msg);
}

pub fn log_warn_impl(msg: &str) {
    tracing::warn!(target: LOG_TARGET, "{}", msg);
}

pub fn log_debug_impl(msg: &str) {
    tracing::debug!(target: LOG_TARGET, "{}", msg);
}

/// Log an info message
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::logging::log_info_impl(&format!($($arg)*))
    };
}

/// Log an error message
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::logging::log_error_impl(&format!($($arg)*))
    };
}

/// Log a warning message
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::logging::log_warn_impl(&format!($($arg)*))
    };
}

/// Log a debug message
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::logging::log_debug_impl(&format!($($arg)*))
    };
}
