/*!
 * Device adapters.
 *
 * One adapter per hardware family, each built from a [`DeviceConfig`] and a
 * transport. They all share the request pipeline and activation handling
 * of [`crate::port`].
 *
 * [`DeviceConfig`]: portflow_core::config::DeviceConfig
 */

pub mod adc;
pub mod digital;
pub mod mfc;
pub mod serializer;

pub use adc::{AdcChannelState, AdcDevice, AdcOp, AdcReply, AdcState};
pub use digital::{DigitalOp, DigitalPort, DigitalReply};
pub use mfc::{MfcDevice, MfcOp, MfcReply};
pub use serializer::{SerialOp, SerialReply, SerializerPort};
