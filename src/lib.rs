//! ServiceNow facility-type bulk updater.
//!
//! Drives a single Chrome instance through the record-update flow (login,
//! global search, open record, set the Facility type field, save) for every
//! hostname read from a spreadsheet column, then writes a per-item CSV
//! report. All behavior is environment-driven; there are no CLI flags.

pub mod browser;
pub mod config;
pub mod report;
pub mod sheet;
pub mod workflow;

use std::path::PathBuf;

/// Get log directory path (shared across modules)
pub fn log_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("sn-facility-updater").join("logs"))
}

/// Initialize logging: console output plus a daily-rolling log file when a
/// log directory is available.
pub fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false);

    if let Some(log_dir) = log_dir() {
        let _ = std::fs::create_dir_all(&log_dir);
        let file_appender = tracing_appender::rolling::daily(&log_dir, "sn-facility-updater.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .with_writer(non_blocking);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();

        None
    }
}
