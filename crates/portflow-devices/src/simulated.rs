/*!
 * Simulated transports.
 *
 * In-memory stand-ins for the register port, bit serializer, analog
 * converter and mass flow controller. Every simulator is a cheap clone
 * around shared state: hand one clone to a device and keep another to
 * drive inputs, inject failures and inspect the call log.
 */
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use portflow_core::types::Timestamp;

use crate::device::{DeviceError, Result};
use crate::transport::{
    AdcFrame, AdcRecord, FrameTransport, LineTransport, ReadUntil, RegisterTransport,
    SerialTransport,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Number of transfers a simulator remembers
pub const CALL_LOG_LIMIT: usize = 1024;

/// Latency, failure injection and call logging shared by every simulator
#[derive(Debug, Clone, Default)]
struct Harness {
    latency: Duration,
    fail_next: Arc<AtomicBool>,
    call_log: Arc<Mutex<VecDeque<String>>>,
}

impl Harness {
    async fn enter(&self, call: String) -> Result<()> {
        let failing = self.fail_next.swap(false, Ordering::SeqCst);
        debug!(call = %call, failing, "Simulated transfer");
        {
            let mut log = lock(&self.call_log);
            if log.len() == CALL_LOG_LIMIT {
                log.pop_front();
            }
            log.push_back(call);
        }

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if failing {
            return Err(DeviceError::transport("simulated failure"));
        }
        Ok(())
    }
}

macro_rules! harness_methods {
    () => {
        /// Delay every transfer by `latency`
        pub fn with_latency(mut self, latency: Duration) -> Self {
            self.harness.latency = latency;
            self
        }

        /// Make the next transfer fail with `TransportFailure`
        pub fn fail_next(&self) {
            self.harness.fail_next.store(true, Ordering::SeqCst);
        }

        /// The most recent transfers, oldest first.
        ///
        /// Only the last [`CALL_LOG_LIMIT`] are kept, so a device that polls
        /// continuously does not grow the log without bound.
        pub fn call_log(&self) -> Vec<String> {
            lock(&self.harness.call_log).iter().cloned().collect()
        }

        /// Forget the recorded transfers
        pub fn clear_call_log(&self) {
            lock(&self.harness.call_log).clear();
        }
    };
}

#[derive(Debug, Default)]
struct Register {
    inputs: u64,
    outputs: u64,
    active: bool,
}

/// Simulated register port.
///
/// Reads return the input levels together with the latched outputs.
#[derive(Debug, Clone, Default)]
pub struct SimulatedRegisterPort {
    register: Arc<Mutex<Register>>,
    harness: Harness,
}

impl SimulatedRegisterPort {
    /// Create a new port with every bit low
    pub fn new() -> Self {
        Self::default()
    }

    harness_methods!();

    /// Drive the input levels seen by the next reads
    pub fn set_inputs(&self, inputs: u64) {
        lock(&self.register).inputs = inputs;
    }

    /// Output levels latched by writes
    pub fn outputs(&self) -> u64 {
        lock(&self.register).outputs
    }

    /// Whether the port was switched into its active mode
    pub fn is_active(&self) -> bool {
        lock(&self.register).active
    }
}

#[async_trait]
impl RegisterTransport for SimulatedRegisterPort {
    async fn read(&mut self) -> Result<(Timestamp, u64)> {
        self.harness.enter("read".to_string()).await?;
        let register = lock(&self.register);
        Ok((Utc::now(), register.inputs | register.outputs))
    }

    async fn write(&mut self, mask: u64, value: u64) -> Result<Timestamp> {
        self.harness
            .enter(format!("write mask={:#b} value={:#b}", mask, value))
            .await?;
        let mut register = lock(&self.register);
        register.outputs = (register.outputs & !mask) | (value & mask);
        Ok(Utc::now())
    }

    async fn set_mode(&mut self, active: bool) -> Result<Timestamp> {
        self.harness.enter(format!("set_mode {}", active)).await?;
        lock(&self.register).active = active;
        Ok(Utc::now())
    }
}

/// Simulated bit serializer
#[derive(Debug, Clone, Default)]
pub struct SimulatedSerializer {
    bits: Arc<Mutex<Vec<bool>>>,
    harness: Harness,
}

impl SimulatedSerializer {
    /// Create a new serializer with `width` low bits
    pub fn new(width: usize) -> Self {
        Self {
            bits: Arc::new(Mutex::new(vec![false; width])),
            harness: Harness::default(),
        }
    }

    harness_methods!();

    /// Force one bit, as an external input would
    pub fn set_bit(&self, index: usize, level: bool) {
        let mut bits = lock(&self.bits);
        if index >= bits.len() {
            bits.resize(index + 1, false);
        }
        bits[index] = level;
    }

    /// Current bit levels
    pub fn bits(&self) -> Vec<bool> {
        lock(&self.bits).clone()
    }
}

#[async_trait]
impl SerialTransport for SimulatedSerializer {
    async fn read(&mut self) -> Result<(Timestamp, Vec<bool>)> {
        self.harness.enter("read".to_string()).await?;
        Ok((Utc::now(), self.bits()))
    }

    async fn write(&mut self, high: &[u32], low: &[u32]) -> Result<Timestamp> {
        self.harness
            .enter(format!("write high={:?} low={:?}", high, low))
            .await?;
        for &index in high {
            self.set_bit(index as usize, true);
        }
        for &index in low {
            self.set_bit(index as usize, false);
        }
        Ok(Utc::now())
    }
}

#[derive(Debug, Default)]
struct Converter {
    frames: VecDeque<[Option<AdcRecord>; 2]>,
    acquiring: bool,
}

/// Simulated two-channel converter.
///
/// Reads hand out queued frames; with nothing queued a frame carries no
/// records.
#[derive(Debug, Clone, Default)]
pub struct SimulatedAdc {
    converter: Arc<Mutex<Converter>>,
    harness: Harness,
}

impl SimulatedAdc {
    /// Create a new idle converter
    pub fn new() -> Self {
        Self::default()
    }

    harness_methods!();

    /// Queue the records returned by a future read
    pub fn push_frame(&self, channels: [Option<AdcRecord>; 2]) {
        lock(&self.converter).frames.push_back(channels);
    }

    /// Whether acquisition was started
    pub fn is_acquiring(&self) -> bool {
        lock(&self.converter).acquiring
    }
}

#[async_trait]
impl FrameTransport for SimulatedAdc {
    async fn read(&mut self) -> Result<AdcFrame> {
        self.harness.enter("read".to_string()).await?;
        let mut converter = lock(&self.converter);
        if !converter.acquiring {
            return Err(DeviceError::transport("converter is not acquiring"));
        }
        let channels = converter.frames.pop_front().unwrap_or_default();
        Ok(AdcFrame {
            timestamp: Utc::now(),
            channels,
        })
    }

    async fn set_mode(&mut self, active: bool) -> Result<Timestamp> {
        self.harness.enter(format!("set_mode {}", active)).await?;
        lock(&self.converter).acquiring = active;
        Ok(Utc::now())
    }
}

#[derive(Debug, Default)]
struct Controller {
    open: bool,
    rate: f64,
    output: String,
    scripted: VecDeque<String>,
    silent: bool,
    written: Vec<String>,
}

/// Simulated mass flow controller speaking the line protocol
#[derive(Debug, Clone)]
pub struct SimulatedMfc {
    id: u8,
    controller: Arc<Mutex<Controller>>,
    harness: Harness,
}

impl SimulatedMfc {
    /// Create a new unit at address `id`
    pub fn new(id: u8) -> Self {
        Self {
            id,
            controller: Arc::new(Mutex::new(Controller::default())),
            harness: Harness::default(),
        }
    }

    harness_methods!();

    /// Measured rate reported by rate queries
    pub fn rate(&self) -> f64 {
        lock(&self.controller).rate
    }

    /// Change the measured rate
    pub fn set_rate(&self, rate: f64) {
        lock(&self.controller).rate = rate;
    }

    /// Answer the next command with `reply` instead of the proper response.
    /// The command then has no effect on the unit.
    pub fn script_reply<S: Into<String>>(&self, reply: S) {
        lock(&self.controller).scripted.push_back(reply.into());
    }

    /// Stop answering commands
    pub fn set_silent(&self, silent: bool) {
        lock(&self.controller).silent = silent;
    }

    /// Every command written so far
    pub fn written(&self) -> Vec<String> {
        lock(&self.controller).written.clone()
    }

    fn respond(&self, controller: &mut Controller, command: &str) -> String {
        let prefix = format!("!{:02X},", self.id);
        let body = match command
            .strip_prefix(&prefix)
            .and_then(|rest| rest.strip_suffix("\r\n"))
        {
            Some(body) => body,
            // Commands for other units go unanswered.
            None => return String::new(),
        };

        let reply = match body {
            "M,D" => "MD".to_string(),
            "U,SLPM" => "USLPM".to_string(),
            "F" => format!("{:.3}", controller.rate),
            _ => match body.strip_prefix("S,").map(str::parse::<f64>) {
                Some(Ok(rate)) => {
                    controller.rate = rate;
                    format!("S{:.3}", rate)
                }
                _ => "ER".to_string(),
            },
        };
        format!("{}{}\r\n", prefix, reply)
    }
}

#[async_trait]
impl LineTransport for SimulatedMfc {
    async fn open(&mut self) -> Result<()> {
        self.harness.enter("open".to_string()).await?;
        lock(&self.controller).open = true;
        Ok(())
    }

    async fn write(&mut self, payload: &str, _timeout: Duration) -> Result<usize> {
        self.harness.enter(format!("write {:?}", payload)).await?;
        let mut controller = lock(&self.controller);
        if !controller.open {
            return Err(DeviceError::transport("channel is not open"));
        }
        controller.written.push(payload.to_string());
        if controller.silent {
            return Ok(payload.len());
        }

        let reply = match controller.scripted.pop_front() {
            Some(reply) => reply,
            None => self.respond(&mut controller, payload),
        };
        controller.output.push_str(&reply);
        Ok(payload.len())
    }

    async fn read(&mut self, until: ReadUntil, timeout: Duration) -> Result<(Timestamp, String)> {
        self.harness.enter(format!("read {:?}", until)).await?;
        let received = {
            let mut controller = lock(&self.controller);
            let output = &mut controller.output;
            let mut end = match until {
                ReadUntil::Length(len) => len.min(output.len()),
                ReadUntil::Terminator { max, stop } => {
                    let limit = max.min(output.len());
                    output.as_bytes()[..limit]
                        .iter()
                        .position(|&b| b == stop)
                        .map_or(limit, |pos| pos + 1)
                }
            };
            while !output.is_char_boundary(end) {
                end += 1;
            }
            output.drain(..end).collect::<String>()
        };

        if received.is_empty() {
            tokio::time::sleep(timeout).await;
            return Err(DeviceError::TransportTimeout(format!(
                "no response within {:?}",
                timeout
            )));
        }
        Ok((Utc::now(), received))
    }
}
