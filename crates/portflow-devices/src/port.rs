/*!
 * Shared core of every device adapter.
 *
 * A port owns the channel map, the request pipeline and the activation
 * state machine of one device and performs the precondition checks the
 * adapters have in common.
 */
use std::fmt;
use std::sync::Arc;

use tracing::{info, warn};

use portflow_core::config::{DeviceConfig, DeviceKind};
use portflow_core::event::SharedEventBus;
use portflow_core::types::Id;

use crate::activation::{Activation, ActivationConfig, ModeSwitch};
use crate::channel::ChannelMap;
use crate::device::{Capabilities, DeviceContext, DeviceError, DeviceEvent, DeviceInfo, Result};
use crate::pipeline::{Completion, Executor, RequestPipeline};

/// Publishes "state updated" for one device from inside listeners
#[derive(Debug, Clone)]
pub(crate) struct Notifier {
    device_id: Id,
    events: SharedEventBus,
}

impl Notifier {
    pub(crate) fn state_updated(&self) {
        let event = DeviceEvent::StateUpdated {
            device_id: self.device_id.clone(),
        };
        if let Err(e) = self.events.publish(event) {
            warn!(device = %self.device_id, "Failed to publish state update: {}", e);
        }
    }
}

pub(crate) struct Port<E: Executor> {
    info: DeviceInfo,
    channels: Arc<ChannelMap>,
    pipeline: RequestPipeline<E>,
    activation: Activation<E>,
    events: SharedEventBus,
    continuous: bool,
}

impl<E: Executor> Port<E> {
    /// Spawn the pipeline and wire up activation for a configured device
    pub(crate) fn new(
        config: &DeviceConfig,
        kind: DeviceKind,
        channels: ChannelMap,
        executor: E,
        read_op: E::Op,
        mode_switch: Option<ModeSwitch<E::Op>>,
        context: &DeviceContext,
    ) -> Result<Self> {
        if config.kind != kind {
            return Err(DeviceError::config(format!(
                "device '{}' is configured as {}, not {}",
                config.name, config.kind, kind
            )));
        }
        if channels.is_empty() {
            return Err(DeviceError::config(format!(
                "device '{}' has no channels",
                config.name
            )));
        }

        let id = Id::from_string(&config.name);
        let capabilities = Capabilities {
            can_read: channels.can_read(),
            can_write: channels.can_write(),
            channel_count: channels.len(),
        };
        let pipeline =
            RequestPipeline::spawn_with_config(&config.name, kind.as_str(), executor, &context.pipeline);

        let mut activation = Activation::new(
            id.clone(),
            pipeline.clone(),
            read_op,
            ActivationConfig {
                readable: capabilities.can_read,
                continuous: config.continuous,
                release: config.release,
            },
            context.events.clone(),
        );
        if let Some(switch) = mode_switch {
            activation = activation.with_mode_switch(switch.enter_active, switch.enter_inactive);
        }

        info!(
            device = %id,
            kind = %kind,
            channels = capabilities.channel_count,
            continuous = config.continuous,
            "Device created"
        );

        Ok(Self {
            info: DeviceInfo {
                id,
                name: config.name.clone(),
                kind,
                capabilities,
            },
            channels: Arc::new(channels),
            pipeline,
            activation,
            events: context.events.clone(),
            continuous: config.continuous,
        })
    }

    pub(crate) fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub(crate) fn channels(&self) -> &Arc<ChannelMap> {
        &self.channels
    }

    pub(crate) fn pipeline(&self) -> &RequestPipeline<E> {
        &self.pipeline
    }

    pub(crate) fn activation(&self) -> &Activation<E> {
        &self.activation
    }

    pub(crate) fn notifier(&self) -> Notifier {
        Notifier {
            device_id: self.info.id.clone(),
            events: self.events.clone(),
        }
    }

    pub(crate) fn ensure_readable(&self, operation: &str) -> Result<()> {
        if self.info.capabilities.can_read {
            return Ok(());
        }
        Err(DeviceError::DirectionViolation(format!(
            "cannot {} on '{}': it has no input channels",
            operation, self.info.name
        )))
    }

    pub(crate) fn ensure_writable(&self, operation: &str) -> Result<()> {
        if self.info.capabilities.can_write {
            return Ok(());
        }
        Err(DeviceError::DirectionViolation(format!(
            "cannot {} on '{}': it has no output channels",
            operation, self.info.name
        )))
    }

    pub(crate) fn ensure_active(&self, operation: &'static str) -> Result<()> {
        self.activation.ensure_active(operation)
    }

    /// Explicit read. Continuous polling already keeps the state current,
    /// so no request is queued then.
    pub(crate) fn one_shot_read<T, F>(&self, read_op: E::Op, map: F) -> Result<Option<Completion<T>>>
    where
        T: Send + 'static,
        F: FnOnce(E::Output) -> T + Send + 'static,
    {
        self.ensure_readable("get_state")?;
        self.ensure_active("get_state")?;
        if self.continuous {
            return Ok(None);
        }
        Ok(Some(self.pipeline.call_then(read_op, map)))
    }

    pub(crate) async fn shutdown(&self) -> Result<()> {
        info!(device = %self.info.id, "Shutting down device");
        self.pipeline.shutdown().await
    }
}

impl<E: Executor> fmt::Debug for Port<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("info", &self.info)
            .field("channels", &self.channels)
            .field("activation", &self.activation)
            .field("continuous", &self.continuous)
            .finish()
    }
}

/// Implement [`Device`](crate::device::Device) for an adapter with a `port` field
macro_rules! impl_device {
    ($device:ty) => {
        #[async_trait::async_trait]
        impl $crate::device::Device for $device {
            fn info(&self) -> &$crate::device::DeviceInfo {
                self.port.info()
            }

            fn activation_state(&self) -> $crate::activation::ActivationState {
                self.port.activation().state()
            }

            fn activate(&self) -> $crate::device::Result<bool> {
                self.port.activation().activate()
            }

            fn deactivate(&self) -> $crate::device::Result<bool> {
                self.port.activation().deactivate()
            }

            fn get_state(
                &self,
            ) -> $crate::device::Result<
                ::std::option::Option<$crate::pipeline::Completion<portflow_core::types::Timestamp>>,
            > {
                <$device>::get_state(self)
            }

            async fn shutdown(&self) -> $crate::device::Result<()> {
                self.port.shutdown().await
            }
        }
    };
}

pub(crate) use impl_device;
