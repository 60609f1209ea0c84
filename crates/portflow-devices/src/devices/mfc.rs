/*!
 * Mass flow controller.
 *
 * A single bidirectional rate channel driven over the line protocol in
 * [`crate::protocol`]. Activation opens the line and initializes the unit;
 * deactivation closes the valve by setting the rate to zero.
 */

use async_trait::async_trait;

use portflow_core::config::{DeviceConfig, DeviceKind};
use portflow_core::types::{Direction, Timestamp};

use crate::activation::ModeSwitch;
use crate::channel::{Channel, ChannelMap};
use crate::device::{DeviceContext, DeviceError, Result};
use crate::pipeline::{Completion, Executor, Operation, RequestPipeline};
use crate::port::{impl_device, Port};
use crate::protocol::RateProtocol;
use crate::state::{SharedState, Stamped};
use crate::transport::LineTransport;

/// Requests understood by the controller
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MfcOp {
    /// Open the line and put the unit in digital SLPM mode at rate zero
    Initialize,
    /// Change the setpoint
    SetRate(f64),
    /// Read the measured rate
    QueryRate,
}

impl Operation for MfcOp {
    fn name(&self) -> &'static str {
        match self {
            MfcOp::Initialize => "initialize",
            MfcOp::SetRate(_) => "set_rate",
            MfcOp::QueryRate => "query_rate",
        }
    }
}

/// Result of a controller exchange
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MfcReply {
    /// Measured rate
    Rate {
        /// When the response was read
        timestamp: Timestamp,
        /// Rate in SLPM
        rate: f64,
    },
    /// The unit echoed the command
    Done {
        /// When the echo was read
        timestamp: Timestamp,
    },
}

impl MfcReply {
    /// When the unit answered
    pub fn timestamp(&self) -> Timestamp {
        match self {
            MfcReply::Rate { timestamp, .. } | MfcReply::Done { timestamp } => *timestamp,
        }
    }
}

/// Pipeline executor owning the line and the protocol state
pub struct MfcExecutor {
    transport: Box<dyn LineTransport>,
    protocol: RateProtocol,
}

#[async_trait]
impl Executor for MfcExecutor {
    type Op = MfcOp;
    type Output = MfcReply;

    async fn execute(&mut self, op: &MfcOp) -> Result<MfcReply> {
        let transport = &mut *self.transport;
        match *op {
            MfcOp::Initialize => {
                transport.open().await?;
                let timestamp = self.protocol.initialize(transport).await?;
                Ok(MfcReply::Done { timestamp })
            }
            MfcOp::SetRate(rate) => {
                let timestamp = self.protocol.write_rate(transport, rate).await?;
                Ok(MfcReply::Done { timestamp })
            }
            MfcOp::QueryRate => {
                let (timestamp, rate) = self.protocol.read_rate(transport).await?;
                Ok(MfcReply::Rate { timestamp, rate })
            }
        }
    }
}

/// A mass flow controller on a line transport
#[derive(Debug)]
pub struct MfcDevice {
    port: Port<MfcExecutor>,
    rate: SharedState<Option<Stamped<f64>>>,
}

impl MfcDevice {
    /// Create a new controller on `transport`.
    ///
    /// The configuration must carry the unit's line settings. Without
    /// configured channels a single `rate` channel is used.
    pub fn from_config<T>(config: &DeviceConfig, transport: T, context: &DeviceContext) -> Result<Self>
    where
        T: LineTransport,
    {
        let line = config.line.as_ref().ok_or_else(|| {
            DeviceError::config(format!("controller '{}' has no line settings", config.name))
        })?;
        let protocol = RateProtocol::new(line.id, line.timeout())?;

        let channels = if config.channels.is_empty() {
            ChannelMap::new(vec![Channel::new("rate", 0, Direction::Bidirectional)])?
        } else {
            ChannelMap::from_config(&config.channels)?
        };
        if channels.len() != 1 {
            return Err(DeviceError::config(format!(
                "controller '{}' needs exactly one channel, got {}",
                config.name,
                channels.len()
            )));
        }

        let executor = MfcExecutor {
            transport: Box::new(transport),
            protocol,
        };
        let mode_switch = ModeSwitch {
            enter_active: MfcOp::Initialize,
            enter_inactive: MfcOp::SetRate(0.0),
        };
        let port = Port::new(
            config,
            DeviceKind::Mfc,
            channels,
            executor,
            MfcOp::QueryRate,
            Some(mode_switch),
            context,
        )?;

        let rate = SharedState::<Option<Stamped<f64>>>::default();
        for operation in ["initialize", "set_rate", "query_rate"] {
            let state = rate.clone();
            let notifier = port.notifier();
            port.pipeline().listen(operation, move |reply, op| {
                // Initialization leaves the setpoint at zero.
                let value = match (*reply, *op) {
                    (MfcReply::Rate { rate, .. }, _) => rate,
                    (_, MfcOp::SetRate(rate)) => rate,
                    _ => 0.0,
                };
                state.update(|r| *r = Some(Stamped::new(value, reply.timestamp())));
                notifier.state_updated();
            });
        }

        Ok(Self { port, rate })
    }

    /// Change the setpoint.
    ///
    /// The rate must be finite and not negative.
    pub fn set_state(&self, rate: f64) -> Result<Completion<Timestamp>> {
        if !rate.is_finite() || rate < 0.0 {
            return Err(DeviceError::InvalidValue(format!("invalid flow rate {}", rate)));
        }
        self.port.ensure_writable("set_state")?;
        self.port.ensure_active("set_state")?;
        Ok(self
            .port
            .pipeline()
            .call_then(MfcOp::SetRate(rate), |reply| reply.timestamp()))
    }

    /// Query the rate once; `None` under continuous polling
    pub fn get_state(&self) -> Result<Option<Completion<Timestamp>>> {
        self.port.one_shot_read(MfcOp::QueryRate, |reply| reply.timestamp())
    }

    /// Last confirmed rate
    pub fn rate(&self) -> Option<Stamped<f64>> {
        self.rate.snapshot()
    }

    /// The device's request pipeline
    pub fn pipeline(&self) -> &RequestPipeline<MfcExecutor> {
        self.port.pipeline()
    }
}

impl_device!(MfcDevice);

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use portflow_core::event::SharedEventBus;

    use super::*;
    use crate::activation::ActivationState;
    use crate::device::{Device, DeviceEvent};
    use crate::simulated::SimulatedMfc;

    fn config() -> DeviceConfig {
        DeviceConfig::new("mfc", DeviceKind::Mfc)
            .with_line(0x0A, Duration::from_millis(50))
            .with_continuous(false)
    }

    async fn active_mfc(sim: &SimulatedMfc) -> MfcDevice {
        let mfc = MfcDevice::from_config(&config(), sim.clone(), &DeviceContext::default()).unwrap();
        mfc.activate().unwrap();
        mfc.pipeline().sync().await.unwrap();
        assert_eq!(mfc.activation_state(), ActivationState::Active);
        mfc
    }

    #[tokio::test]
    async fn test_activation_initializes_unit() {
        let sim = SimulatedMfc::new(0x0A);
        let mfc = active_mfc(&sim).await;

        assert_eq!(
            sim.written(),
            vec!["!0A,M,D\r\n", "!0A,U,SLPM\r\n", "!0A,S,0.000\r\n"]
        );
        assert_eq!(mfc.rate().map(|r| r.value), Some(0.0));
        assert!(mfc.capabilities().can_read && mfc.capabilities().can_write);
    }

    #[tokio::test]
    async fn test_set_rate_wire_format() {
        let sim = SimulatedMfc::new(0x0A);
        let mfc = active_mfc(&sim).await;

        let ts = mfc.set_state(12.5).unwrap().await.unwrap();
        assert_eq!(sim.written().last().map(String::as_str), Some("!0A,S,12.500\r\n"));
        assert_eq!(mfc.rate(), Some(Stamped::new(12.5, ts)));
    }

    #[test_log::test(tokio::test)]
    async fn test_wrong_echo_leaves_rate() {
        let sim = SimulatedMfc::new(0x0A);
        let mfc = active_mfc(&sim).await;
        let before = mfc.rate();

        sim.script_reply("!0A,S12.501\r\n");
        let err = mfc.set_state(12.5).unwrap().await.unwrap_err();
        assert!(matches!(err, DeviceError::ProtocolMismatch { .. }), "{:?}", err);
        assert_eq!(mfc.rate(), before);

        // The pipeline keeps serving requests after the failure
        mfc.set_state(1.0).unwrap().await.unwrap();
        assert_eq!(mfc.rate().map(|r| r.value), Some(1.0));
    }

    #[tokio::test]
    async fn test_silent_unit_times_out() {
        let sim = SimulatedMfc::new(0x0A);
        let mfc = active_mfc(&sim).await;

        sim.set_silent(true);
        let err = mfc.get_state().unwrap().unwrap().await.unwrap_err();
        assert!(matches!(err, DeviceError::TransportTimeout(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn test_query_updates_rate() {
        let sim = SimulatedMfc::new(0x0A);
        let mfc = active_mfc(&sim).await;

        sim.set_rate(4.75);
        mfc.get_state().unwrap().unwrap().await.unwrap();
        assert_eq!(mfc.rate().map(|r| r.value), Some(4.75));
    }

    #[tokio::test]
    async fn test_deactivation_zeroes_rate() {
        let sim = SimulatedMfc::new(0x0A);
        let mfc = active_mfc(&sim).await;
        mfc.set_state(3.0).unwrap().await.unwrap();

        mfc.deactivate().unwrap();
        mfc.pipeline().sync().await.unwrap();
        assert_eq!(mfc.activation_state(), ActivationState::Inactive);
        assert_eq!(sim.written().last().map(String::as_str), Some("!0A,S,0.000\r\n"));
        assert_eq!(mfc.rate().map(|r| r.value), Some(0.0));

        assert!(matches!(
            mfc.set_state(1.0),
            Err(DeviceError::InvalidActivationState { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_initialization_stays_inactive() {
        let events = SharedEventBus::new();
        let mut errors = events.subscribe::<DeviceEvent>().unwrap();
        let sim = SimulatedMfc::new(0x0A);
        sim.set_silent(true);
        let mfc = MfcDevice::from_config(&config(), sim.clone(), &DeviceContext::new(events)).unwrap();

        mfc.activate().unwrap();
        mfc.pipeline().sync().await.unwrap();
        assert_eq!(mfc.activation_state(), ActivationState::Inactive);
        assert!(errors
            .drain()
            .iter()
            .any(|e| matches!(e, DeviceEvent::Error { .. })));
    }

    #[tokio::test]
    async fn test_rejects_invalid_rates() {
        let sim = SimulatedMfc::new(0x0A);
        let mfc = active_mfc(&sim).await;
        for rate in [-1.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(mfc.set_state(rate), Err(DeviceError::InvalidValue(_))));
        }
    }

    #[test]
    fn test_requires_line_settings() {
        let config = DeviceConfig::new("mfc", DeviceKind::Mfc);
        let err = MfcDevice::from_config(&config, SimulatedMfc::new(1), &DeviceContext::default()).unwrap_err();
        assert!(matches!(err, DeviceError::ConfigurationError(_)));
    }
}
