/*!
 * Transport collaborators.
 *
 * The device adapters only depend on these signatures. Real drivers and
 * the simulated transports in [`crate::simulated`] implement them.
 */
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use portflow_core::types::Timestamp;

use crate::device::Result;

/// Register-style digital port
#[async_trait]
pub trait RegisterTransport: Send + 'static {
    /// Read the whole register
    async fn read(&mut self) -> Result<(Timestamp, u64)>;

    /// Drive the bits selected by `mask` to the levels in `value`
    async fn write(&mut self, mask: u64, value: u64) -> Result<Timestamp>;

    /// Switch the port in or out of its active mode
    async fn set_mode(&mut self, active: bool) -> Result<Timestamp>;
}

/// Bit serializer addressed by bit index
#[async_trait]
pub trait SerialTransport: Send + 'static {
    /// Read every bit, indexed by bit position
    async fn read(&mut self) -> Result<(Timestamp, Vec<bool>)>;

    /// Set the listed bits high and low
    async fn write(&mut self, high: &[u32], low: &[u32]) -> Result<Timestamp>;
}

/// One channel's share of an analog frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdcRecord {
    /// Raw converter counts
    pub raw: Vec<u32>,
    /// Derived values, opaque to the device layer
    pub data: Vec<f64>,
    /// Index of the first sample in the converter's own clock
    pub ts_idx: u64,
}

/// One read of the two-channel converter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdcFrame {
    /// When the frame was read
    pub timestamp: Timestamp,
    /// Per-channel records; a channel without new data is `None`
    pub channels: [Option<AdcRecord>; 2],
}

/// Two-channel analog-to-digital converter
#[async_trait]
pub trait FrameTransport: Send + 'static {
    /// Read the next frame
    async fn read(&mut self) -> Result<AdcFrame>;

    /// Start or stop acquisition
    async fn set_mode(&mut self, active: bool) -> Result<Timestamp>;
}

/// Where a line read stops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadUntil {
    /// Exactly this many bytes
    Length(usize),
    /// Up to `max` bytes, stopping after `stop`
    Terminator {
        /// Upper bound on the bytes read
        max: usize,
        /// Byte that ends the read
        stop: u8,
    },
}

/// Line-oriented serial channel
#[async_trait]
pub trait LineTransport: Send + 'static {
    /// Open the channel
    async fn open(&mut self) -> Result<()>;

    /// Write `payload`, returning the number of bytes accepted
    async fn write(&mut self, payload: &str, timeout: Duration) -> Result<usize>;

    /// Read a response
    async fn read(&mut self, until: ReadUntil, timeout: Duration) -> Result<(Timestamp, String)>;
}
