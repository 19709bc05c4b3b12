//! Logging setup

use tracing::info;
use uniseq_types::{Result, UniseqError};

/// Initialize logging
///
/// `level` is one of trace/debug/info/warn/error (info otherwise), `format`
/// is `json` or `pretty`. `RUST_LOG` directives are honoured on top.
pub fn init_logging(level: &str, format: &str) -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let level = match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    let env_filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into());

    let initialized = match format.to_lowercase().as_str() {
        "json" => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_thread_names(true))
            .try_init(),
        _ => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().pretty().with_thread_names(true))
            .try_init(),
    };
    initialized.map_err(|e| UniseqError::internal(format!("Failed to initialize logging: {}", e)))?;

    info!("Logging initialized with level: {} and format: {}", level, format);
    Ok(())
}
