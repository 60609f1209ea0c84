/*!
 * portflow devices
 *
 * Request pipelines, the activation state machine and the device adapters
 * for polled digital ports, a two-channel converter and a mass flow
 * controller.
 */

#![warn(missing_docs)]

// Re-export core types
pub use portflow_core::prelude;

pub mod activation;
pub mod channel;
pub mod device;
pub mod devices;
pub mod pipeline;
pub mod protocol;
pub mod simulated;
pub mod state;
pub mod subscription;
pub mod transport;

pub(crate) mod port;

// Re-export the device surface
pub use activation::{Activation, ActivationState};
pub use channel::{Channel, ChannelMap};
pub use device::{Capabilities, Device, DeviceContext, DeviceError, DeviceEvent, DeviceInfo};
pub use devices::{AdcDevice, DigitalPort, MfcDevice, SerializerPort};
pub use pipeline::{Completion, Executor, Operation, Request, RequestHandle, RequestPipeline};
pub use state::{PortState, Stamped};

/// portflow devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging and report the device layer
pub fn init() -> Result<(), portflow_core::error::Error> {
    portflow_core::init()?;
    tracing::info!("portflow devices {} initialized", VERSION);
    Ok(())
}

/// Device families this crate has adapters for
pub fn available_families() -> Vec<&'static str> {
    use portflow_core::config::DeviceKind;

    [
        DeviceKind::Digital,
        DeviceKind::Serializer,
        DeviceKind::Adc,
        DeviceKind::Mfc,
    ]
    .iter()
    .map(DeviceKind::as_str)
    .collect()
}
