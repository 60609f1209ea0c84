/*!
 * Bit serializer.
 *
 * Like a register port but addressed by bit index: writes pass the lists
 * of bits to drive high and low, reads return every bit.
 */

use async_trait::async_trait;

use portflow_core::config::{DeviceConfig, DeviceKind};
use portflow_core::types::Timestamp;

use crate::activation::ModeSwitch;
use crate::channel::ChannelMap;
use crate::device::{DeviceContext, Result};
use crate::pipeline::{Completion, Executor, Operation, RequestPipeline};
use crate::port::{impl_device, Port};
use crate::state::{PortState, SharedState};
use crate::transport::SerialTransport;

/// Requests understood by a serializer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerialOp {
    /// Read every bit
    Read,
    /// Set the listed bits
    Write {
        /// Bits driven high
        high: Vec<u32>,
        /// Bits driven low
        low: Vec<u32>,
    },
}

impl Operation for SerialOp {
    fn name(&self) -> &'static str {
        match self {
            SerialOp::Read => "read",
            SerialOp::Write { .. } => "write",
        }
    }
}

/// Result of a serializer transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerialReply {
    /// Bit levels indexed by position
    Read {
        /// When the bits were read
        timestamp: Timestamp,
        /// One level per bit
        bits: Vec<bool>,
    },
    /// A write was confirmed
    Done {
        /// When it was confirmed
        timestamp: Timestamp,
    },
}

impl SerialReply {
    /// When the hardware confirmed the transfer
    pub fn timestamp(&self) -> Timestamp {
        match self {
            SerialReply::Read { timestamp, .. } | SerialReply::Done { timestamp } => *timestamp,
        }
    }
}

/// Pipeline executor owning the serializer transport
pub struct SerialExecutor {
    transport: Box<dyn SerialTransport>,
}

#[async_trait]
impl Executor for SerialExecutor {
    type Op = SerialOp;
    type Output = SerialReply;

    async fn execute(&mut self, op: &SerialOp) -> Result<SerialReply> {
        match op {
            SerialOp::Read => {
                let (timestamp, bits) = self.transport.read().await?;
                Ok(SerialReply::Read { timestamp, bits })
            }
            SerialOp::Write { high, low } => {
                let timestamp = self.transport.write(high, low).await?;
                Ok(SerialReply::Done { timestamp })
            }
        }
    }
}

/// A serializer-backed digital port
#[derive(Debug)]
pub struct SerializerPort {
    port: Port<SerialExecutor>,
    state: SharedState<PortState>,
}

impl SerializerPort {
    /// Create a new port on `transport`
    pub fn from_config<T>(config: &DeviceConfig, transport: T, context: &DeviceContext) -> Result<Self>
    where
        T: SerialTransport,
    {
        let channels = ChannelMap::from_config(&config.channels)?;
        // The serializer has no hardware mode; activation only gates polling.
        let mode_switch: Option<ModeSwitch<SerialOp>> = None;
        let executor = SerialExecutor {
            transport: Box::new(transport),
        };
        let port = Port::new(
            config,
            DeviceKind::Serializer,
            channels,
            executor,
            SerialOp::Read,
            mode_switch,
            context,
        )?;

        let state = SharedState::<PortState>::default();
        {
            let channels = port.channels().clone();
            let state = state.clone();
            let notifier = port.notifier();
            port.pipeline().listen("read", move |reply, _| {
                if let SerialReply::Read { timestamp, bits } = reply {
                    let values = channels.iter().filter_map(|c| {
                        bits.get(c.index as usize).map(|level| (c.name.clone(), *level))
                    });
                    state.update(|s| s.apply(values, *timestamp));
                    notifier.state_updated();
                }
            });
        }
        {
            let channels = port.channels().clone();
            let state = state.clone();
            let notifier = port.notifier();
            port.pipeline().listen("write", move |reply, op| {
                if let SerialOp::Write { high, low } = op {
                    let levels = high.iter().map(|i| (*i, true)).chain(low.iter().map(|i| (*i, false)));
                    let values = levels.filter_map(|(index, level)| {
                        channels
                            .resolve_index(index)
                            .ok()
                            .map(|name| (name.to_string(), level))
                    });
                    state.update(|s| s.apply(values, reply.timestamp()));
                    notifier.state_updated();
                }
            });
        }

        Ok(Self { port, state })
    }

    /// Drive the channels in `high` high and those in `low` low
    pub fn set_state<H, L>(&self, high: H, low: L) -> Result<Completion<Timestamp>>
    where
        H: IntoIterator,
        H::Item: AsRef<str>,
        L: IntoIterator,
        L::Item: AsRef<str>,
    {
        let high: Vec<String> = high.into_iter().map(|n| n.as_ref().to_string()).collect();
        let low: Vec<String> = low.into_iter().map(|n| n.as_ref().to_string()).collect();

        self.port.ensure_writable("set_state")?;
        let channels = self.port.channels();
        let (high_bits, low_bits) = channels.encode_indices(&high, &low)?;
        channels.check_writable(high.iter().chain(low.iter()))?;
        self.port.ensure_active("set_state")?;

        let op = SerialOp::Write {
            high: high_bits,
            low: low_bits,
        };
        Ok(self.port.pipeline().call_then(op, |reply| reply.timestamp()))
    }

    /// Read every bit once; `None` under continuous polling
    pub fn get_state(&self) -> Result<Option<Completion<Timestamp>>> {
        self.port.one_shot_read(SerialOp::Read, |reply| reply.timestamp())
    }

    /// Snapshot of the state vector
    pub fn state(&self) -> PortState {
        self.state.snapshot()
    }

    /// Last known level of a channel
    pub fn value(&self, name: &str) -> Result<Option<bool>> {
        self.port.channels().resolve(name)?;
        Ok(self.state.read(|s| s.get(name)))
    }

    /// Channel layout
    pub fn channels(&self) -> &ChannelMap {
        self.port.channels()
    }

    /// The device's request pipeline
    pub fn pipeline(&self) -> &RequestPipeline<SerialExecutor> {
        self.port.pipeline()
    }
}

impl_device!(SerializerPort);

#[cfg(test)]
mod tests {
    use portflow_core::types::Direction;

    use super::*;
    use crate::device::{Device, DeviceError};
    use crate::simulated::SimulatedSerializer;

    fn config() -> DeviceConfig {
        DeviceConfig::new("relays", DeviceKind::Serializer)
            .with_channel("pump", 0, Direction::Output)
            .with_channel("valve", 3, Direction::Bidirectional)
            .with_channel("door", 5, Direction::Input)
            .with_continuous(false)
    }

    #[tokio::test]
    async fn test_write_passes_indices() {
        let sim = SimulatedSerializer::new(8);
        let port = SerializerPort::from_config(&config(), sim.clone(), &DeviceContext::default()).unwrap();
        port.activate().unwrap();

        port.set_state(["valve"], ["pump"]).unwrap().await.unwrap();
        let bits = sim.bits();
        assert!(bits[3]);
        assert!(!bits[0]);
        assert_eq!(port.value("valve").unwrap(), Some(true));
        assert_eq!(port.value("pump").unwrap(), Some(false));
        assert_eq!(port.value("door").unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_updates_every_channel() {
        let sim = SimulatedSerializer::new(8);
        let port = SerializerPort::from_config(&config(), sim.clone(), &DeviceContext::default()).unwrap();
        port.activate().unwrap();

        sim.set_bit(5, true);
        port.get_state().unwrap().unwrap().await.unwrap();

        let state = port.state();
        assert_eq!(state.get("door"), Some(true));
        assert_eq!(state.get("valve"), Some(false));
        assert_eq!(state.get("pump"), Some(false));
    }

    #[tokio::test]
    async fn test_write_to_input_is_rejected() {
        let port =
            SerializerPort::from_config(&config(), SimulatedSerializer::new(8), &DeviceContext::default())
                .unwrap();
        port.activate().unwrap();

        let err = port.set_state(Vec::<&str>::new(), ["door"]).unwrap_err();
        assert!(matches!(err, DeviceError::DirectionViolation(_)), "{:?}", err);
    }
}
