/*!
 * Activation state machine.
 *
 * Drives a device through `inactive -> activating -> active -> deactivating
 * -> inactive` and starts or stops the continuous read subscription on the
 * way. A deactivation whose subscription is still queued does not complete
 * until a flushed cancellation has drained it from the pipeline.
 *
 * Devices that need the hardware switched into an active mode first issue
 * one "enter active" request; only its completion starts polling. Leaving
 * mirrors this with an "enter inactive" request whose completion marks the
 * device inactive.
 */
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use portflow_core::event::SharedEventBus;
use portflow_core::types::{Id, ReleaseMode};

use crate::device::{DeviceError, DeviceEvent, Result};
use crate::pipeline::{Executor, Request, RequestPipeline};
use crate::subscription::{ErrorHandler, ReadSubscription};

/// Activation state of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationState {
    /// Not running
    #[default]
    Inactive,
    /// Waiting for the hardware to confirm the active mode
    Activating,
    /// Running
    Active,
    /// Waiting for the hardware or the request queue to let go
    Deactivating,
}

impl fmt::Display for ActivationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActivationState::Inactive => "inactive",
            ActivationState::Activating => "activating",
            ActivationState::Active => "active",
            ActivationState::Deactivating => "deactivating",
        };
        f.write_str(s)
    }
}

/// Per-device activation settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivationConfig {
    /// The device has readable channels
    pub readable: bool,
    /// Keep a repeating read running while active
    pub continuous: bool,
    /// How a draining deactivation is reported
    pub release: ReleaseMode,
}

impl ActivationConfig {
    /// Whether an active device keeps a read subscription
    pub fn polls(&self) -> bool {
        self.readable && self.continuous
    }
}

/// The pair of requests that move the hardware in and out of its active mode
#[derive(Debug, Clone)]
pub struct ModeSwitch<O> {
    /// Issued by `activate`
    pub enter_active: O,
    /// Issued by `deactivate`
    pub enter_inactive: O,
}

struct Inner<E: Executor> {
    state: ActivationState,
    // Set by activate, cleared by deactivate.
    wanted: bool,
    reads: ReadSubscription<E>,
}

/// Activation state machine of one device
///
/// Clones share the same state.
pub struct Activation<E: Executor> {
    device_id: Id,
    pipeline: RequestPipeline<E>,
    config: ActivationConfig,
    mode_switch: Option<ModeSwitch<E::Op>>,
    inner: Arc<Mutex<Inner<E>>>,
    events: SharedEventBus,
}

impl<E: Executor> Clone for Activation<E> {
    fn clone(&self) -> Self {
        Self {
            device_id: self.device_id.clone(),
            pipeline: self.pipeline.clone(),
            config: self.config,
            mode_switch: self.mode_switch.clone(),
            inner: self.inner.clone(),
            events: self.events.clone(),
        }
    }
}

impl<E: Executor> fmt::Debug for Activation<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Activation")
            .field("device_id", &self.device_id)
            .field("config", &self.config)
            .field("mode_switch", &self.mode_switch)
            .finish_non_exhaustive()
    }
}

impl<E: Executor> Activation<E> {
    /// Create a new state machine that polls with `read_op`
    pub fn new(
        device_id: Id,
        pipeline: RequestPipeline<E>,
        read_op: E::Op,
        config: ActivationConfig,
        events: SharedEventBus,
    ) -> Self {
        let reporter: ErrorHandler = {
            let events = events.clone();
            let device_id = device_id.clone();
            Arc::new(move |e: &DeviceError| publish_error(&events, &device_id, e))
        };
        let reads = ReadSubscription::new(pipeline.clone(), read_op).with_error_handler(reporter);

        Self {
            device_id,
            pipeline,
            config,
            mode_switch: None,
            inner: Arc::new(Mutex::new(Inner {
                state: ActivationState::Inactive,
                wanted: false,
                reads,
            })),
            events,
        }
    }

    /// Switch the hardware mode with these requests on every transition
    pub fn with_mode_switch(mut self, enter_active: E::Op, enter_inactive: E::Op) -> Self {
        self.mode_switch = Some(ModeSwitch {
            enter_active,
            enter_inactive,
        });
        self
    }

    /// Current state
    pub fn state(&self) -> ActivationState {
        self.lock().state
    }

    /// Whether the device is active
    pub fn is_active(&self) -> bool {
        self.state() == ActivationState::Active
    }

    /// Whether the device has been asked to run and not yet asked to stop
    pub fn is_wanted(&self) -> bool {
        self.lock().wanted
    }

    /// Whether a read subscription is live
    pub fn is_polling(&self) -> bool {
        self.lock().reads.is_live()
    }

    /// Whether a flushed cancellation is still draining
    pub fn is_canceling(&self) -> bool {
        self.lock().reads.is_canceling()
    }

    /// The activation settings
    pub fn config(&self) -> &ActivationConfig {
        &self.config
    }

    /// Fail with `InvalidActivationState` unless the device is active
    pub fn ensure_active(&self, operation: &'static str) -> Result<()> {
        match self.state() {
            ActivationState::Active => Ok(()),
            state => Err(DeviceError::InvalidActivationState { operation, state }),
        }
    }

    /// Start the device.
    ///
    /// Returns `Ok(false)` if it is already active or activating and fails
    /// while a deactivation is still in progress.
    pub fn activate(&self) -> Result<bool> {
        let mut inner = self.lock();
        let state = inner.state;
        match state {
            ActivationState::Deactivating => Err(DeviceError::InvalidActivationState {
                operation: "activate",
                state,
            }),
            ActivationState::Active | ActivationState::Activating => Ok(false),
            ActivationState::Inactive => {
                inner.wanted = true;
                match &self.mode_switch {
                    Some(switch) => {
                        self.transition(&mut inner, ActivationState::Activating);
                        let activation = self.clone();
                        self.pipeline.submit(
                            Request::new(switch.enter_active.clone())
                                .with_callback(move |result, _| activation.entered_active(result.err())),
                        );
                    }
                    None => {
                        self.transition(&mut inner, ActivationState::Active);
                        self.start_polling(&mut inner);
                    }
                }
                Ok(true)
            }
        }
    }

    /// Stop the device.
    ///
    /// Returns `Ok(false)` if it is already inactive or deactivating and fails
    /// while an activation is still in progress.
    pub fn deactivate(&self) -> Result<bool> {
        let mut inner = self.lock();
        let state = inner.state;
        match state {
            ActivationState::Activating => Err(DeviceError::InvalidActivationState {
                operation: "deactivate",
                state,
            }),
            ActivationState::Inactive | ActivationState::Deactivating => Ok(false),
            ActivationState::Active => {
                inner.wanted = false;
                self.transition(&mut inner, ActivationState::Deactivating);

                if let Some(switch) = &self.mode_switch {
                    inner.reads.stop();
                    let activation = self.clone();
                    self.pipeline.submit(
                        Request::new(switch.enter_inactive.clone())
                            .with_callback(move |result, _| activation.entered_inactive(result.err())),
                    );
                } else if inner.reads.is_live() {
                    if self.config.release == ReleaseMode::Immediate {
                        self.transition(&mut inner, ActivationState::Inactive);
                    }
                    let activation = self.clone();
                    inner.reads.stop_flushed(move || activation.drained());
                } else {
                    self.transition(&mut inner, ActivationState::Inactive);
                }
                Ok(true)
            }
        }
    }

    fn entered_active(&self, error: Option<DeviceError>) {
        let mut inner = self.lock();
        match error {
            None => {
                if inner.state == ActivationState::Activating {
                    self.transition(&mut inner, ActivationState::Active);
                    self.start_polling(&mut inner);
                }
            }
            Some(e) => {
                warn!(device = %self.device_id, "Failed to enter active mode: {}", e);
                inner.wanted = false;
                self.transition(&mut inner, ActivationState::Inactive);
                publish_error(&self.events, &self.device_id, &e);
            }
        }
    }

    fn entered_inactive(&self, error: Option<DeviceError>) {
        let mut inner = self.lock();
        if let Some(e) = error {
            warn!(device = %self.device_id, "Failed to leave active mode, releasing anyway: {}", e);
            publish_error(&self.events, &self.device_id, &e);
        }
        if inner.state == ActivationState::Deactivating {
            self.transition(&mut inner, ActivationState::Inactive);
        }
    }

    fn drained(&self) {
        let mut inner = self.lock();
        inner.reads.drained();
        debug!(device = %self.device_id, wanted = inner.wanted, "Read subscription drained");

        if inner.state == ActivationState::Deactivating {
            self.transition(&mut inner, ActivationState::Inactive);
        }
        if inner.state == ActivationState::Active {
            self.start_polling(&mut inner);
        }
    }

    fn start_polling(&self, inner: &mut Inner<E>) {
        if self.config.polls() && inner.wanted {
            inner.reads.start();
        }
    }

    fn transition(&self, inner: &mut Inner<E>, new: ActivationState) {
        let old = inner.state;
        if old == new {
            return;
        }
        inner.state = new;
        debug!(device = %self.device_id, %old, %new, "Activation changed");

        let event = DeviceEvent::ActivationChanged {
            device_id: self.device_id.clone(),
            old,
            new,
        };
        if let Err(e) = self.events.publish(event) {
            warn!(device = %self.device_id, "Failed to publish activation change: {}", e);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<E>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn publish_error(events: &SharedEventBus, device_id: &Id, error: &DeviceError) {
    let event = DeviceEvent::Error {
        device_id: device_id.clone(),
        message: error.to_string(),
    };
    if let Err(e) = events.publish(event) {
        warn!(device = %device_id, "Failed to publish device error: {}", e);
    }
}
