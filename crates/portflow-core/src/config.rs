/*!
 * Configuration management for portflow.
 *
 * This module loads, validates and exposes the settings for logging, the
 * request pipelines and the device instances a host wants to run.
 */
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::types::{Direction, ReleaseMode};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General configuration
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Request pipeline configuration
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Device instances
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Application environment (development, production, etc.)
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log filter (trace, debug, info, warn, error or an env-filter directive)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to include the event target in log lines
    #[serde(default = "default_true")]
    pub with_target: bool,
}

/// Request pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Capacity of the per-type event channels
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Yield to the scheduler after every executed request.
    ///
    /// While a repeating request is queued the worker yields regardless.
    #[serde(default = "default_true")]
    pub yield_between_requests: bool,
}

/// The hardware family a device instance belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Register-style digital port (mask/value writes)
    Digital,
    /// Bit serializer (index-list writes, full-vector reads)
    Serializer,
    /// Two-channel analog-to-digital converter
    Adc,
    /// Mass flow controller on a line protocol
    Mfc,
}

impl DeviceKind {
    /// Name used in configuration files and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Digital => "digital",
            DeviceKind::Serializer => "serializer",
            DeviceKind::Adc => "adc",
            DeviceKind::Mfc => "mfc",
        }
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One named physical channel of a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Human-meaningful name, unique within the device
    pub name: String,
    /// Bit position or channel index, unique within the device
    pub index: u32,
    /// Direction of the channel
    pub direction: Direction,
}

/// Line protocol settings for line-oriented devices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineConfig {
    /// Address of the unit on the line
    pub id: u8,

    /// Per-exchange timeout in milliseconds
    #[serde(default = "default_line_timeout_ms")]
    pub timeout_ms: u64,
}

impl LineConfig {
    /// The per-exchange timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Settings for one device instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device name, also used as its ID
    pub name: String,

    /// Hardware family
    pub kind: DeviceKind,

    /// Channel layout
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,

    /// Keep a repeating read running while the device is active
    #[serde(default = "default_true")]
    pub continuous: bool,

    /// How deactivation reports completion
    #[serde(default)]
    pub release: ReleaseMode,

    /// Switch the hardware into an active mode before polling (digital ports)
    #[serde(default)]
    pub mode_switch: bool,

    /// Bits of a read result that carry valid data; all channel bits when unset
    #[serde(default)]
    pub read_mask: Option<u64>,

    /// Line protocol settings (mfc)
    #[serde(default)]
    pub line: Option<LineConfig>,
}

impl DeviceConfig {
    /// Create a device config with default flags and no channels
    pub fn new<S: Into<String>>(name: S, kind: DeviceKind) -> Self {
        Self {
            name: name.into(),
            kind,
            channels: Vec::new(),
            continuous: true,
            release: ReleaseMode::default(),
            mode_switch: false,
            read_mask: None,
            line: None,
        }
    }

    /// Add a channel
    pub fn with_channel<S: Into<String>>(mut self, name: S, index: u32, direction: Direction) -> Self {
        self.channels.push(ChannelConfig {
            name: name.into(),
            index,
            direction,
        });
        self
    }

    /// Set whether the device polls continuously
    pub fn with_continuous(mut self, continuous: bool) -> Self {
        self.continuous = continuous;
        self
    }

    /// Set the release mode
    pub fn with_release(mut self, release: ReleaseMode) -> Self {
        self.release = release;
        self
    }

    /// Require a mode switch before polling
    pub fn with_mode_switch(mut self, mode_switch: bool) -> Self {
        self.mode_switch = mode_switch;
        self
    }

    /// Set the read mask
    pub fn with_read_mask(mut self, mask: u64) -> Self {
        self.read_mask = Some(mask);
        self
    }

    /// Set the line protocol settings
    pub fn with_line(mut self, id: u8, timeout: Duration) -> Self {
        self.line = Some(LineConfig {
            id,
            timeout_ms: crate::utils::duration_to_millis(timeout),
        });
        self
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            environment: default_environment(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            with_target: true,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            event_capacity: default_event_capacity(),
            yield_between_requests: true,
        }
    }
}

fn default_app_name() -> String {
    "portflow".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_event_capacity() -> usize {
    1024
}

fn default_line_timeout_ms() -> u64 {
    4000
}

impl Config {
    /// Check cross-device constraints
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for device in &self.devices {
            if device.name.is_empty() {
                return Err(Error::config("device name must not be empty"));
            }
            if !names.insert(device.name.as_str()) {
                return Err(Error::config(format!("duplicate device name '{}'", device.name)));
            }
            if device.kind == DeviceKind::Mfc && device.line.is_none() {
                return Err(Error::config(format!(
                    "device '{}' needs a [line] section",
                    device.name
                )));
            }
        }
        Ok(())
    }

    /// Look up a device by name
    pub fn device(&self, name: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.name == name)
    }

    /// Render the configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
    override_with: Option<Config>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the environment variable prefix for configuration
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Override with an existing config
    pub fn override_with(mut self, config: Config) -> Self {
        self.override_with = Some(config);
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<Config> {
        if let Some(config) = self.override_with {
            config.validate()?;
            return Ok(config);
        }

        let mut builder = ConfigLib::builder().add_source(ConfigLib::try_from(&Config::default())?);

        if let Some(config_file) = self.config_file {
            if Path::new(&config_file).exists() {
                debug!("Loading configuration from {}", config_file);
                builder = builder.add_source(File::with_name(&config_file));
            } else {
                debug!("Configuration file {} does not exist, using defaults", config_file);
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!("Loading configuration from environment variables with prefix {}", prefix);
            builder = builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config: Config = builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        config.validate()?;
        info!(devices = config.devices.len(), "Configuration loaded");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.general.app_name, "portflow");
        assert_eq!(config.logging.level, "info");
        assert!(config.pipeline.yield_between_requests);
        assert!(config.devices.is_empty());
    }

    #[test]
    fn test_config_builder_defaults() {
        let config = ConfigBuilder::new().build().unwrap();
        assert_eq!(config.general.app_name, "portflow");
        assert_eq!(config.pipeline.event_capacity, 1024);
    }

    #[test]
    fn test_config_builder_with_file() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("rig.toml");

        fs::write(
            &file_path,
            r#"
                [general]
                app_name = "odor-rig"

                [logging]
                level = "debug"

                [[devices]]
                name = "valves"
                kind = "digital"
                release = "immediate"
                read_mask = 3
                channels = [
                    { name = "a", index = 0, direction = "input" },
                    { name = "b", index = 1, direction = "input" },
                    { name = "c", index = 2, direction = "output" },
                ]

                [[devices]]
                name = "mfc"
                kind = "mfc"
                line = { id = 1 }
            "#,
        )?;

        let config = ConfigBuilder::new().with_config_file(&file_path).build()?;

        assert_eq!(config.general.app_name, "odor-rig");
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.devices.len(), 2);

        let valves = config.device("valves").unwrap();
        assert_eq!(valves.kind, DeviceKind::Digital);
        assert_eq!(valves.release, ReleaseMode::Immediate);
        assert_eq!(valves.read_mask, Some(3));
        assert!(valves.continuous);
        assert_eq!(valves.channels[2].direction, Direction::Output);

        let mfc = config.device("mfc").unwrap();
        let line = mfc.line.as_ref().unwrap();
        assert_eq!(line.id, 1);
        assert_eq!(line.timeout(), Duration::from_millis(4000));
        Ok(())
    }

    #[test]
    fn test_config_builder_missing_file_uses_defaults() -> Result<()> {
        let config = ConfigBuilder::new()
            .with_config_file("/nonexistent/portflow.toml")
            .build()?;
        assert_eq!(config.general.app_name, "portflow");
        Ok(())
    }

    #[test]
    fn test_config_builder_with_env() -> Result<()> {
        env::set_var("PORTFLOW_TEST__GENERAL__APP_NAME", "env-app");
        env::set_var("PORTFLOW_TEST__LOGGING__LEVEL", "trace");

        let config = ConfigBuilder::new()
            .with_environment_prefix("portflow_test")
            .build()?;

        assert_eq!(config.general.app_name, "env-app");
        assert_eq!(config.logging.level, "trace");

        env::remove_var("PORTFLOW_TEST__GENERAL__APP_NAME");
        env::remove_var("PORTFLOW_TEST__LOGGING__LEVEL");
        Ok(())
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let config = Config {
            devices: vec![
                DeviceConfig::new("valves", DeviceKind::Digital),
                DeviceConfig::new("valves", DeviceKind::Serializer),
            ],
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_requires_line_for_mfc() {
        let mut config = Config {
            devices: vec![DeviceConfig::new("mfc", DeviceKind::Mfc)],
            ..Config::default()
        };
        assert!(config.validate().is_err());

        config.devices[0] = DeviceConfig::new("mfc", DeviceKind::Mfc)
            .with_line(0x0A, Duration::from_millis(500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_override_round_trips_through_toml() -> Result<()> {
        let config = Config {
            devices: vec![DeviceConfig::new("adc", DeviceKind::Adc)
                .with_channel("left", 0, Direction::Input)
                .with_continuous(false)],
            ..Config::default()
        };

        let rendered = config.to_toml()?;
        assert!(rendered.contains("kind = \"adc\""));

        let built = ConfigBuilder::new().override_with(config.clone()).build()?;
        assert_eq!(built.devices, config.devices);
        Ok(())
    }
}
