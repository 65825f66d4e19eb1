//! Structured logging setup.
//!
//! Installs a `tracing-subscriber` formatter configured from [`LoggingConfig`].
//! `RUST_LOG` takes precedence over the configured level when present.

use crate::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Calling this more than once is harmless;
/// later calls leave the first subscriber in place.
pub fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str().to_lowercase()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let installed = if config.json_format {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    };

    if installed {
        tracing::debug!(app = %config.app_name, "Logging initialised");
    }
}
