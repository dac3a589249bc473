//! Centralized logging configuration for batch-calib binaries
//!
//! This module provides a consistent logging setup with custom formatting
//! and default INFO level across all executables.

use tracing::Level;

/// Initialize the tracing subscriber with the standard configuration
///
/// Default log level: INFO (overrideable via RUST_LOG environment variable)
///
/// # Example
/// ```no_run
/// use batch_calib::init_logger;
///
/// init_logger();
/// tracing::info!("Calibration started");
/// ```
///
/// # Environment Variables
/// ```bash
/// RUST_LOG=debug cargo run --bin synthetic_calibration
/// RUST_LOG=batch_calib::optimizer=trace cargo run --bin synthetic_calibration
/// ```
pub fn init_logger() {
    init_logger_with_level(Level::INFO)
}

/// Initialize the tracing subscriber with a custom default level
///
/// Calling this more than once is harmless; later calls leave the first
/// subscriber in place.
pub fn init_logger_with_level(default_level: Level) {
    use tracing_subscriber::fmt::time::SystemTime;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .with_timer(SystemTime)
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .try_init();
}
