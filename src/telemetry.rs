//! Tracing initialization.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

use crate::config::{LogFormat, LoggingConfig};

/// Initialize the global tracing subscriber from config. `RUST_LOG`
/// overrides the configured filter. Safe to call more than once; later calls
/// are no-ops.
pub fn init(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter.clone()));
    let result = match config.format {
        LogFormat::Text => Registry::default()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init(),
        LogFormat::Json => Registry::default()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
    };
    // already initialized: keep the existing subscriber
    let _ = result;
}

/// Initialize with defaults. Test and example convenience.
pub fn init_default() {
    init(&LoggingConfig::default());
}
