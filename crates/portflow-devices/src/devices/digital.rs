/*!
 * Digital bit port.
 *
 * Channels map to bits of one hardware register. Writes carry a mask and
 * a value, reads return the whole register and are decoded through the
 * configured read mask.
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
use crate::transport::RegisterTransport;

/// Requests understood by a register port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigitalOp {
    /// Read the whole register
    Read,
    /// Drive the masked bits to `value`
    Write {
        /// Bits being written
        mask: u64,
        /// Levels of the written bits
        value: u64,
    },
    /// Enter or leave the active hardware mode
    SetMode(bool),
}

impl Operation for DigitalOp {
    fn name(&self) -> &'static str {
        match self {
            DigitalOp::Read => "read",
            DigitalOp::Write { .. } => "write",
            DigitalOp::SetMode(_) => "set_mode",
        }
    }
}

/// Result of a register transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigitalReply {
    /// Register contents
    Read {
        /// When the register was read
        timestamp: Timestamp,
        /// Raw register value
        raw: u64,
    },
    /// A write or mode change was confirmed
    Done {
        /// When it was confirmed
        timestamp: Timestamp,
    },
}

impl DigitalReply {
    /// When the hardware confirmed the transfer
    pub fn timestamp(&self) -> Timestamp {
        match self {
            DigitalReply::Read { timestamp, .. } | DigitalReply::Done { timestamp } => *timestamp,
        }
    }
}

/// Pipeline executor owning the register transport
pub struct DigitalExecutor {
    transport: Box<dyn RegisterTransport>,
}

#[async_trait]
impl Executor for DigitalExecutor {
    type Op = DigitalOp;
    type Output = DigitalReply;

    async fn execute(&mut self, op: &DigitalOp) -> Result<DigitalReply> {
        match *op {
            DigitalOp::Read => {
                let (timestamp, raw) = self.transport.read().await?;
                Ok(DigitalReply::Read { timestamp, raw })
            }
            DigitalOp::Write { mask, value } => {
                let timestamp = self.transport.write(mask, value).await?;
                Ok(DigitalReply::Done { timestamp })
            }
            DigitalOp::SetMode(active) => {
                let timestamp = self.transport.set_mode(active).await?;
                Ok(DigitalReply::Done { timestamp })
            }
        }
    }
}

/// A register-backed digital port
#[derive(Debug)]
pub struct DigitalPort {
    port: Port<DigitalExecutor>,
    state: SharedState<PortState>,
    read_mask: u64,
}

impl DigitalPort {
    /// Create a new port on `transport`.
    ///
    /// Without an explicit `read_mask` every readable channel is decoded.
    pub fn from_config<T>(config: &DeviceConfig, transport: T, context: &DeviceContext) -> Result<Self>
    where
        T: RegisterTransport,
    {
        let channels = ChannelMap::from_config(&config.channels)?;
        let read_mask = config.read_mask.unwrap_or_else(|| channels.readable_mask());
        let mode_switch = config.mode_switch.then(|| ModeSwitch {
            enter_active: DigitalOp::SetMode(true),
            enter_inactive: DigitalOp::SetMode(false),
        });
        let executor = DigitalExecutor {
            transport: Box::new(transport),
        };
        let port = Port::new(
            config,
            DeviceKind::Digital,
            channels,
            executor,
            DigitalOp::Read,
            mode_switch,
            context,
        )?;

        let state = SharedState::<PortState>::default();
        {
            let channels = port.channels().clone();
            let state = state.clone();
            let notifier = port.notifier();
            port.pipeline().listen("read", move |reply, _| {
                if let DigitalReply::Read { timestamp, raw } = *reply {
                    state.update(|s| s.apply(channels.decode_mask(read_mask, raw), timestamp));
                    notifier.state_updated();
                }
            });
        }
        {
            let channels = port.channels().clone();
            let state = state.clone();
            let notifier = port.notifier();
            port.pipeline().listen("write", move |reply, op| {
                if let DigitalOp::Write { mask, value } = *op {
                    state.update(|s| s.apply(channels.decode_mask(mask, value), reply.timestamp()));
                    notifier.state_updated();
                }
            });
        }

        Ok(Self {
            port,
            state,
            read_mask,
        })
    }

    /// Drive the channels in `high` high and those in `low` low.
    ///
    /// The returned future resolves with the hardware timestamp once the
    /// write was confirmed and the state vector updated.
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
        let (mask, value) = channels.encode_mask(&high, &low)?;
        channels.check_writable(high.iter().chain(low.iter()))?;
        self.port.ensure_active("set_state")?;

        Ok(self
            .port
            .pipeline()
            .call_then(DigitalOp::Write { mask, value }, |reply| reply.timestamp()))
    }

    /// Read the register once.
    ///
    /// Returns `None` when continuous polling keeps the state current.
    pub fn get_state(&self) -> Result<Option<Completion<Timestamp>>> {
        self.port.one_shot_read(DigitalOp::Read, |reply| reply.timestamp())
    }

    /// Snapshot of the state vector
    pub fn state(&self) -> PortState {
        self.state.snapshot()
    }

    /// Last known level of a channel, `None` before it was first confirmed
    pub fn value(&self, name: &str) -> Result<Option<bool>> {
        self.port.channels().resolve(name)?;
        Ok(self.state.read(|s| s.get(name)))
    }

    /// Bits decoded from every read
    pub fn read_mask(&self) -> u64 {
        self.read_mask
    }

    /// Channel layout
    pub fn channels(&self) -> &ChannelMap {
        self.port.channels()
    }

    /// The device's request pipeline
    pub fn pipeline(&self) -> &RequestPipeline<DigitalExecutor> {
        self.port.pipeline()
    }
}

impl_device!(DigitalPort);

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use portflow_core::config::PipelineConfig;
    use portflow_core::event::SharedEventBus;
    use portflow_core::types::{Direction, ReleaseMode};

    use super::*;
    use crate::activation::ActivationState;
    use crate::device::{Device, DeviceError, DeviceEvent};
    use crate::simulated::SimulatedRegisterPort;

    fn mixed_config() -> DeviceConfig {
        DeviceConfig::new("pins", DeviceKind::Digital)
            .with_channel("A", 0, Direction::Input)
            .with_channel("B", 1, Direction::Input)
            .with_channel("C", 2, Direction::Output)
            .with_read_mask(0b011)
            .with_continuous(false)
    }

    #[tokio::test]
    async fn test_write_then_read_merges_state() {
        let sim = SimulatedRegisterPort::new();
        let port = DigitalPort::from_config(&mixed_config(), sim.clone(), &DeviceContext::default()).unwrap();
        assert!(port.activate().unwrap());
        assert_eq!(port.activation_state(), ActivationState::Active);

        port.set_state(["C"], Vec::<&str>::new()).unwrap().await.unwrap();
        assert_eq!(sim.outputs(), 0b100);
        assert_eq!(port.value("C").unwrap(), Some(true));

        sim.set_inputs(0b001);
        let read = port.get_state().unwrap().expect("one-shot read");
        read.await.unwrap();

        let state = port.state();
        assert_eq!(state.get("A"), Some(true));
        assert_eq!(state.get("B"), Some(false));
        assert_eq!(state.get("C"), Some(true));
        assert!(state.timestamp.is_some());
    }

    #[tokio::test]
    async fn test_write_to_input_is_rejected() {
        let port =
            DigitalPort::from_config(&mixed_config(), SimulatedRegisterPort::new(), &DeviceContext::default())
                .unwrap();
        port.activate().unwrap();

        let err = port.set_state(["A"], Vec::<&str>::new()).unwrap_err();
        assert!(matches!(err, DeviceError::DirectionViolation(_)), "{:?}", err);

        let err = port.set_state(["Z"], Vec::<&str>::new()).unwrap_err();
        assert!(matches!(err, DeviceError::UnknownChannel(_)), "{:?}", err);
        assert!(matches!(port.value("Z"), Err(DeviceError::UnknownChannel(_))));
    }

    #[tokio::test]
    async fn test_input_only_port_cannot_write() {
        let config = DeviceConfig::new("inputs", DeviceKind::Digital)
            .with_channel("A", 0, Direction::Input)
            .with_continuous(false);
        let port =
            DigitalPort::from_config(&config, SimulatedRegisterPort::new(), &DeviceContext::default()).unwrap();
        port.activate().unwrap();

        assert!(!port.capabilities().can_write);
        let err = port.set_state(Vec::<&str>::new(), ["A"]).unwrap_err();
        assert!(matches!(err, DeviceError::DirectionViolation(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn test_requires_active_device() {
        let sim = SimulatedRegisterPort::new();
        let port = DigitalPort::from_config(&mixed_config(), sim.clone(), &DeviceContext::default()).unwrap();

        let err = port.set_state(["C"], Vec::<&str>::new()).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::InvalidActivationState {
                operation: "set_state",
                state: ActivationState::Inactive
            }
        ));
        assert!(port.get_state().is_err());
        assert!(sim.call_log().is_empty());
    }

    #[tokio::test]
    async fn test_continuous_polling_tracks_inputs() {
        let sim = SimulatedRegisterPort::new().with_latency(Duration::from_millis(1));
        let config = mixed_config().with_continuous(true);
        let port = DigitalPort::from_config(&config, sim.clone(), &DeviceContext::default()).unwrap();
        port.activate().unwrap();
        assert!(port.get_state().unwrap().is_none());

        sim.set_inputs(0b010);
        tokio::time::timeout(Duration::from_secs(2), async {
            while port.value("B").unwrap() != Some(true) {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("polling picks up the input change");
        assert_eq!(port.value("A").unwrap(), Some(false));

        port.deactivate().unwrap();
        port.pipeline().sync().await.unwrap();
        assert_eq!(port.activation_state(), ActivationState::Inactive);
        port.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_polling_without_yield_setting_leaves_runtime_responsive() {
        let context = DeviceContext::default().with_pipeline(PipelineConfig {
            yield_between_requests: false,
            ..PipelineConfig::default()
        });
        let sim = SimulatedRegisterPort::new();
        let port = DigitalPort::from_config(&mixed_config().with_continuous(true), sim.clone(), &context).unwrap();
        port.activate().unwrap();

        tokio::time::timeout(Duration::from_secs(2), port.pipeline().sync())
            .await
            .expect("polling worker gave the runtime a turn")
            .unwrap();
        assert!(!sim.call_log().is_empty());

        port.deactivate().unwrap();
        port.pipeline().sync().await.unwrap();
        assert_eq!(port.activation_state(), ActivationState::Inactive);
        port.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_while_draining_releases_port() {
        let config = mixed_config()
            .with_continuous(true)
            .with_release(ReleaseMode::Deferred);
        let port = DigitalPort::from_config(&config, SimulatedRegisterPort::new(), &DeviceContext::default()).unwrap();
        port.activate().unwrap();
        port.deactivate().unwrap();
        assert_eq!(port.activation_state(), ActivationState::Deactivating);

        port.shutdown().await.unwrap();
        assert_eq!(port.activation_state(), ActivationState::Inactive);
    }

    #[tokio::test]
    async fn test_get_state_through_device_trait() {
        let sim = SimulatedRegisterPort::new();
        let port = DigitalPort::from_config(&mixed_config(), sim.clone(), &DeviceContext::default()).unwrap();
        let device: &dyn Device = &port;
        device.activate().unwrap();

        sim.set_inputs(0b010);
        device.get_state().unwrap().expect("one-shot read").await.unwrap();
        assert_eq!(port.value("B").unwrap(), Some(true));
    }

    #[tokio::test]
    async fn test_mode_switch_on_activation() {
        let sim = SimulatedRegisterPort::new();
        let config = mixed_config()
            .with_mode_switch(true)
            .with_release(ReleaseMode::Immediate);
        let port = DigitalPort::from_config(&config, sim.clone(), &DeviceContext::default()).unwrap();

        port.activate().unwrap();
        assert_eq!(port.activation_state(), ActivationState::Activating);
        port.pipeline().sync().await.unwrap();
        assert_eq!(port.activation_state(), ActivationState::Active);
        assert!(sim.is_active());

        port.deactivate().unwrap();
        port.pipeline().sync().await.unwrap();
        assert_eq!(port.activation_state(), ActivationState::Inactive);
        assert!(!sim.is_active());
        assert_eq!(sim.call_log(), vec!["set_mode true", "set_mode false"]);
    }

    #[tokio::test]
    async fn test_updates_are_published() {
        let events = SharedEventBus::new();
        let mut updates = events.subscribe::<DeviceEvent>().unwrap();
        let context = DeviceContext::new(events);
        let port = DigitalPort::from_config(&mixed_config(), SimulatedRegisterPort::new(), &context).unwrap();
        port.activate().unwrap();

        port.get_state().unwrap().unwrap().await.unwrap();

        let mut saw_update = false;
        while let Some(event) = updates.try_recv() {
            if let DeviceEvent::StateUpdated { device_id } = event {
                assert_eq!(device_id.as_str(), "pins");
                saw_update = true;
            }
        }
        assert!(saw_update);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_state() {
        let sim = SimulatedRegisterPort::new();
        let port = DigitalPort::from_config(&mixed_config(), sim.clone(), &DeviceContext::default()).unwrap();
        port.activate().unwrap();

        sim.fail_next();
        let result = port.set_state(["C"], Vec::<&str>::new()).unwrap().await;
        assert!(result.is_err());
        assert_eq!(port.value("C").unwrap(), None);
    }

    #[test]
    fn test_kind_must_match() {
        let config = DeviceConfig::new("adc", DeviceKind::Adc).with_channel("A", 0, Direction::Input);
        let err = DigitalPort::from_config(&config, SimulatedRegisterPort::new(), &DeviceContext::default())
            .unwrap_err();
        assert!(matches!(err, DeviceError::ConfigurationError(_)));
    }
}
