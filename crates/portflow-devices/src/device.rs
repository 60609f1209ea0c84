/*!
 * Device trait and core device abstractions.
 *
 * This module defines the error type, descriptive information, events and
 * the activation surface shared by every portflow device family.
 */
use std::fmt::Debug;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use portflow_core::{
    config::{Config, DeviceKind, PipelineConfig},
    error::Error as CoreError,
    event::{Event, SharedEventBus},
    types::{Id, Timestamp},
};

use crate::activation::ActivationState;
use crate::pipeline::Completion;

/// Error type for device operations
#[derive(Error, Debug)]
pub enum DeviceError {
    /// The channel name or index is not part of the device
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    /// A write was attempted on an input or a read on an output
    #[error("Direction violation: {0}")]
    DirectionViolation(String),

    /// The activation state forbids the operation
    #[error("Cannot {operation} while the device is {state}")]
    InvalidActivationState {
        /// The rejected operation
        operation: &'static str,
        /// The state the device was in
        state: ActivationState,
    },

    /// The device answered something other than what the protocol requires
    #[error("Protocol mismatch: expected {expected:?}, received {received:?}")]
    ProtocolMismatch {
        /// What the device should have sent
        expected: String,
        /// What the device actually sent
        received: String,
    },

    /// The transport did not answer in time
    #[error("Transport timeout: {0}")]
    TransportTimeout(String),

    /// Opaque failure of the underlying transport
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// A value outside what the device accepts
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Core error
    #[error("Core error: {0}")]
    Core(CoreError),
}

impl From<CoreError> for DeviceError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Timeout(msg) => DeviceError::TransportTimeout(msg),
            other => DeviceError::Core(other),
        }
    }
}

impl DeviceError {
    /// Create a new transport failure
    pub fn transport<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::TransportFailure(msg.as_ref().to_string())
    }

    /// Create a new configuration error
    pub fn config<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::ConfigurationError(msg.as_ref().to_string())
    }
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

/// What a device can do, derived from its channel layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// At least one channel can be read
    pub can_read: bool,
    /// At least one channel can be written
    pub can_write: bool,
    /// Number of configured channels
    pub channel_count: usize,
}

/// Device information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// The device ID
    pub id: Id,
    /// The device name
    pub name: String,
    /// The hardware family
    pub kind: DeviceKind,
    /// The device capabilities
    pub capabilities: Capabilities,
}

/// Device event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeviceEvent {
    /// A read or write result was applied to the device's state vector
    StateUpdated {
        /// The device ID
        device_id: Id,
    },
    /// The activation state changed
    ActivationChanged {
        /// The device ID
        device_id: Id,
        /// The old state
        old: ActivationState,
        /// The new state
        new: ActivationState,
    },
    /// A failure that was handled inside the worker
    Error {
        /// The device ID
        device_id: Id,
        /// The error message
        message: String,
    },
}

impl Event for DeviceEvent {
    fn event_type(&self) -> &'static str {
        match self {
            DeviceEvent::StateUpdated { .. } => "state_updated",
            DeviceEvent::ActivationChanged { .. } => "activation_changed",
            DeviceEvent::Error { .. } => "error",
        }
    }

    fn source(&self) -> &Id {
        match self {
            DeviceEvent::StateUpdated { device_id }
            | DeviceEvent::ActivationChanged { device_id, .. }
            | DeviceEvent::Error { device_id, .. } => device_id,
        }
    }
}

/// Shared services a device is constructed with
#[derive(Debug, Clone, Default)]
pub struct DeviceContext {
    /// Bus that receives device events
    pub events: SharedEventBus,
    /// Settings for the device's request pipeline
    pub pipeline: PipelineConfig,
}

impl DeviceContext {
    /// Create a new context around an event bus
    pub fn new(events: SharedEventBus) -> Self {
        Self {
            events,
            pipeline: PipelineConfig::default(),
        }
    }

    /// Create a context from the application configuration
    pub fn from_config(config: &Config) -> Self {
        Self {
            events: SharedEventBus::with_capacity(config.pipeline.event_capacity),
            pipeline: config.pipeline.clone(),
        }
    }

    /// Use specific pipeline settings
    pub fn with_pipeline(mut self, pipeline: PipelineConfig) -> Self {
        self.pipeline = pipeline;
        self
    }
}

/// The activation surface every device family exposes
///
/// `set_state` lives on the concrete device types because its arguments
/// differ per family, and the converter has no writable channel at all.
#[async_trait]
pub trait Device: Send + Sync + Debug {
    /// Get the device information
    fn info(&self) -> &DeviceInfo;

    /// Get the device ID
    fn id(&self) -> &Id {
        &self.info().id
    }

    /// Get the device name
    fn name(&self) -> &str {
        &self.info().name
    }

    /// Get the device capabilities
    fn capabilities(&self) -> Capabilities {
        self.info().capabilities
    }

    /// Current activation state
    fn activation_state(&self) -> ActivationState;

    /// Start the device. Returns `Ok(false)` when it already was active.
    fn activate(&self) -> Result<bool>;

    /// Stop the device. Returns `Ok(false)` when it already was inactive.
    fn deactivate(&self) -> Result<bool>;

    /// Read the device once.
    ///
    /// Resolves to the time the hardware answered. Returns `Ok(None)` while
    /// continuous polling already keeps the state current.
    fn get_state(&self) -> Result<Option<Completion<Timestamp>>>;

    /// Stop the device's worker, dropping every pending request
    async fn shutdown(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_timeout_becomes_transport_timeout() {
        let err: DeviceError = CoreError::timeout("query rate").into();
        assert!(matches!(err, DeviceError::TransportTimeout(ref m) if m == "query rate"));

        let err: DeviceError = CoreError::config("bad").into();
        assert!(matches!(err, DeviceError::Core(CoreError::Config(_))));
    }

    #[test]
    fn test_error_messages() {
        let err = DeviceError::InvalidActivationState {
            operation: "activate",
            state: ActivationState::Deactivating,
        };
        assert_eq!(err.to_string(), "Cannot activate while the device is deactivating");

        let err = DeviceError::ProtocolMismatch {
            expected: "!0A,MD\r\n".to_string(),
            received: "!0A,ER\r\n".to_string(),
        };
        assert!(err.to_string().contains("\\r\\n"));
    }

    #[test]
    fn test_event_source() {
        let event = DeviceEvent::ActivationChanged {
            device_id: "valves".into(),
            old: ActivationState::Inactive,
            new: ActivationState::Active,
        };
        assert_eq!(event.source().as_str(), "valves");
        assert_eq!(event.event_type(), "activation_changed");
    }

    #[test]
    fn test_context_from_config() {
        let mut config = Config::default();
        config.pipeline.yield_between_requests = false;
        let context = DeviceContext::from_config(&config);
        assert!(!context.pipeline.yield_between_requests);
    }
}
