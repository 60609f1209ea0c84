/*!
 * Two-channel analog-to-digital converter.
 *
 * Acquisition is started and stopped with a mode switch. Every read
 * returns a frame with an optional record per channel; a channel without
 * a record keeps its previous value.
 */
use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use portflow_core::config::{DeviceConfig, DeviceKind};
use portflow_core::types::{Direction, Timestamp};

use crate::activation::ModeSwitch;
use crate::channel::{Channel, ChannelMap};
use crate::device::{DeviceContext, DeviceError, Result};
use crate::pipeline::{Completion, Executor, Operation, RequestPipeline};
use crate::port::{impl_device, Port};
use crate::state::{SharedState, Stamped};
use crate::transport::{AdcFrame, AdcRecord, FrameTransport};

/// Number of converter channels
pub const ADC_CHANNELS: u32 = 2;

/// Requests understood by the converter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdcOp {
    /// Read the next frame
    Read,
    /// Start or stop acquisition
    SetMode(bool),
}

impl Operation for AdcOp {
    fn name(&self) -> &'static str {
        match self {
            AdcOp::Read => "read",
            AdcOp::SetMode(_) => "set_mode",
        }
    }
}

/// Result of a converter transfer
#[derive(Debug, Clone, PartialEq)]
pub enum AdcReply {
    /// A frame was read
    Frame(AdcFrame),
    /// A mode change was confirmed
    Done {
        /// When it was confirmed
        timestamp: Timestamp,
    },
}

impl AdcReply {
    /// When the hardware confirmed the transfer
    pub fn timestamp(&self) -> Timestamp {
        match self {
            AdcReply::Frame(frame) => frame.timestamp,
            AdcReply::Done { timestamp } => *timestamp,
        }
    }
}

/// Latest record of one channel, stamped with the frame it came from
pub type AdcChannelState = Stamped<AdcRecord>;

/// State vector of the converter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdcState {
    /// Latest record per channel name
    pub channels: BTreeMap<String, AdcChannelState>,
    /// Time of the last frame
    pub timestamp: Option<Timestamp>,
}

impl AdcState {
    /// Latest record of a channel
    pub fn get(&self, name: &str) -> Option<&AdcChannelState> {
        self.channels.get(name)
    }

    fn apply(&mut self, channels: &ChannelMap, frame: &AdcFrame) -> bool {
        let mut updated = false;
        for (index, record) in frame.channels.iter().enumerate() {
            let (Some(record), Ok(name)) = (record, channels.resolve_index(index as u32)) else {
                continue;
            };
            self.channels
                .insert(name.to_string(), Stamped::new(record.clone(), frame.timestamp));
            updated = true;
        }
        self.timestamp = Some(frame.timestamp);
        updated
    }
}

/// Pipeline executor owning the frame transport
pub struct AdcExecutor {
    transport: Box<dyn FrameTransport>,
}

#[async_trait]
impl Executor for AdcExecutor {
    type Op = AdcOp;
    type Output = AdcReply;

    async fn execute(&mut self, op: &AdcOp) -> Result<AdcReply> {
        match *op {
            AdcOp::Read => Ok(AdcReply::Frame(self.transport.read().await?)),
            AdcOp::SetMode(active) => {
                let timestamp = self.transport.set_mode(active).await?;
                Ok(AdcReply::Done { timestamp })
            }
        }
    }
}

/// A two-channel converter
#[derive(Debug)]
pub struct AdcDevice {
    port: Port<AdcExecutor>,
    state: SharedState<AdcState>,
}

impl AdcDevice {
    /// Create a new converter on `transport`.
    ///
    /// Without configured channels the two inputs are named `ch0` and `ch1`.
    pub fn from_config<T>(config: &DeviceConfig, transport: T, context: &DeviceContext) -> Result<Self>
    where
        T: FrameTransport,
    {
        let channels = if config.channels.is_empty() {
            ChannelMap::new(
                (0..ADC_CHANNELS)
                    .map(|i| Channel::new(format!("ch{}", i), i, Direction::Input))
                    .collect(),
            )?
        } else {
            ChannelMap::from_config(&config.channels)?
        };
        for channel in channels.iter() {
            if channel.index >= ADC_CHANNELS {
                return Err(DeviceError::config(format!(
                    "converter channel '{}' has index {}, only {} channels exist",
                    channel.name, channel.index, ADC_CHANNELS
                )));
            }
            if channel.direction != Direction::Input {
                return Err(DeviceError::config(format!(
                    "converter channel '{}' must be an input",
                    channel.name
                )));
            }
        }

        let executor = AdcExecutor {
            transport: Box::new(transport),
        };
        let mode_switch = ModeSwitch {
            enter_active: AdcOp::SetMode(true),
            enter_inactive: AdcOp::SetMode(false),
        };
        let port = Port::new(
            config,
            DeviceKind::Adc,
            channels,
            executor,
            AdcOp::Read,
            Some(mode_switch),
            context,
        )?;

        let state = SharedState::<AdcState>::default();
        {
            let channels = port.channels().clone();
            let state = state.clone();
            let notifier = port.notifier();
            port.pipeline().listen("read", move |reply, _| {
                if let AdcReply::Frame(frame) = reply {
                    if state.update(|s| s.apply(&channels, frame)) {
                        notifier.state_updated();
                    }
                }
            });
        }

        Ok(Self { port, state })
    }

    /// Read one frame; `None` under continuous polling
    pub fn get_state(&self) -> Result<Option<Completion<Timestamp>>> {
        self.port.one_shot_read(AdcOp::Read, |reply| reply.timestamp())
    }

    /// Snapshot of the state vector
    pub fn state(&self) -> AdcState {
        self.state.snapshot()
    }

    /// Latest record of a channel, `None` before its first frame
    pub fn record(&self, name: &str) -> Result<Option<AdcChannelState>> {
        self.port.channels().resolve(name)?;
        Ok(self.state.read(|s| s.get(name).cloned()))
    }

    /// Channel layout
    pub fn channels(&self) -> &ChannelMap {
        self.port.channels()
    }

    /// The device's request pipeline
    pub fn pipeline(&self) -> &RequestPipeline<AdcExecutor> {
        self.port.pipeline()
    }
}

impl_device!(AdcDevice);
