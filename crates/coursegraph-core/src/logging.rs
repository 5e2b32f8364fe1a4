//! Tracing subscriber setup for hosts embedding the library

use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

/// Build the filter: `RUST_LOG` wins, else `coursegraph_core={level}`
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let directive = format!("coursegraph_core={}", config.level)
        .parse()
        .map_err(|e| Error::ConfigError(format!("Invalid log level '{}': {}", config.level, e)))?;
    Ok(EnvFilter::new("warn").add_directive(directive))
}

/// Install a global fmt subscriber
///
/// Returns `Ok(false)` when a subscriber was already installed.
pub fn init(config: &LoggingConfig) -> Result<bool> {
    let filter = env_filter(config)?;
    let registry = tracing_subscriber::registry().with(filter);

    let installed = if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer().with_target(true)).try_init()
    };
    Ok(installed.is_ok())
}
