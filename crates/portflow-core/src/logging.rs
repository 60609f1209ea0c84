/*!
 * Logging functionality for portflow.
 *
 * This module provides tracing setup and the spans every device worker and
 * hardware transfer runs under.
 */
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

/// Initialize the logging system with default configuration
pub fn init() -> Result<()> {
    init_from_config(&LoggingConfig::default())
}

/// Initialize the logging system with a specific filter
///
/// # Arguments
///
/// * `filter` - The log filter string (e.g., "info", "debug", "portflow_devices=trace")
pub fn init_with_filter(filter: &str) -> Result<()> {
    init_from_config(&LoggingConfig {
        level: filter.to_string(),
        ..LoggingConfig::default()
    })
}

/// Initialize the logging system from a logging configuration.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_from_config(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(config.with_target))
        .with(filter)
        .try_init()
        .map_err(|e| Error::runtime(format!("Failed to initialize logging: {}", e)))
}

/// A type alias for a tracing span
pub type Span = tracing::Span;

/// Span for everything a single device does, including its pipeline worker
///
/// # Arguments
///
/// * `kind` - The device family (e.g. "digital", "mfc")
/// * `name` - The device instance name
pub fn device_span(kind: &str, name: &str) -> Span {
    tracing::info_span!("device", kind = %kind, name = %name)
}

/// Span for one hardware transfer
///
/// # Arguments
///
/// * `operation` - The operation being executed
/// * `device` - The device executing it
pub fn request_span(operation: &str, device: &str) -> Span {
    tracing::debug_span!("request", op = %operation, device = %device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_fails_cleanly() {
        // Another test may already have installed a subscriber; either way
        // a second install must report an error instead of panicking.
        let _ = init();
        assert!(init_with_filter("debug").is_err());
    }

    #[test]
    fn test_spans_without_subscriber() {
        let span = device_span("digital", "valves");
        let _entered = span.enter();
        let span = request_span("read", "valves");
        let _entered = span.enter();
    }
}
