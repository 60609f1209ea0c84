/*!
 * portflow core
 *
 * Shared services for the portflow device crates: error type,
 * configuration, logging, the typed event bus, and common types.
 */

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod prelude;
pub mod types;
pub mod utils;

/// Re-export of dependencies that are part of the public API
pub mod deps {
    pub use anyhow;
    pub use chrono;
    pub use tokio;
    pub use tracing;
}

/// portflow core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library initialization with default logging
pub fn init() -> Result<(), error::Error> {
    logging::init()?;
    tracing::info!("portflow core {} initialized", VERSION);
    Ok(())
}

/// Library initialization from an application configuration
///
/// Installs logging per the `[logging]` section and reports the application
/// it runs under.
pub fn init_with_config(config: &crate::config::Config) -> Result<(), error::Error> {
    logging::init_from_config(&config.logging)?;
    tracing::info!(
        app = %config.general.app_name,
        environment = %config.general.environment,
        devices = config.devices.len(),
        "portflow core {} initialized",
        VERSION
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_init_with_config_installs_subscriber_once() {
        let config = crate::config::Config::default();
        // Only one global subscriber can exist; another test may own it.
        let first = init_with_config(&config);
        assert!(init_with_config(&config).is_err());
        let _ = first;
    }
}
