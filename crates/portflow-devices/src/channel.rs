/*!
 * Channel map.
 *
 * Bidirectional lookup between human-meaningful channel names and the bit
 * positions they occupy in a device register, plus the masked encode and
 * decode used to move named state across the register boundary.
 */
use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use portflow_core::config::ChannelConfig;
use portflow_core::types::Direction;

use crate::device::{DeviceError, Result};

/// Number of bits a register value can carry
pub const MASK_BITS: u32 = u64::BITS;

/// One named physical channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    /// Name, unique within the device
    pub name: String,
    /// Bit position or channel index, unique within the device
    pub index: u32,
    /// Direction as seen from the host
    pub direction: Direction,
}

impl Channel {
    /// Create a new channel
    pub fn new<S: Into<String>>(name: S, index: u32, direction: Direction) -> Self {
        Self {
            name: name.into(),
            index,
            direction,
        }
    }

    /// The channel's bit in a register mask
    pub fn bit(&self) -> u64 {
        1u64 << self.index
    }
}

impl From<&ChannelConfig> for Channel {
    fn from(config: &ChannelConfig) -> Self {
        Channel::new(config.name.clone(), config.index, config.direction)
    }
}

/// Forward and inverse mapping between channel names and indices
///
/// Immutable once built.
#[derive(Debug, Clone)]
pub struct ChannelMap {
    channels: Vec<Channel>,
    by_name: HashMap<String, usize>,
    by_index: BTreeMap<u32, usize>,
}

impl ChannelMap {
    /// Build a map, rejecting duplicate names, duplicate indices and
    /// indices that do not fit a register
    pub fn new(channels: Vec<Channel>) -> Result<Self> {
        let mut by_name = HashMap::with_capacity(channels.len());
        let mut by_index = BTreeMap::new();

        for (slot, channel) in channels.iter().enumerate() {
            if channel.name.is_empty() {
                return Err(DeviceError::config("channel name must not be empty"));
            }
            if channel.index >= MASK_BITS {
                return Err(DeviceError::config(format!(
                    "channel '{}' index {} does not fit a {}-bit register",
                    channel.name, channel.index, MASK_BITS
                )));
            }
            if by_name.insert(channel.name.clone(), slot).is_some() {
                return Err(DeviceError::config(format!(
                    "duplicate channel name '{}'",
                    channel.name
                )));
            }
            if by_index.insert(channel.index, slot).is_some() {
                return Err(DeviceError::config(format!(
                    "duplicate channel index {}",
                    channel.index
                )));
            }
        }

        Ok(Self {
            channels,
            by_name,
            by_index,
        })
    }

    /// Build a map from configuration entries
    pub fn from_config(channels: &[ChannelConfig]) -> Result<Self> {
        Self::new(channels.iter().map(Channel::from).collect())
    }

    /// Index of the named channel
    pub fn resolve(&self, name: &str) -> Result<u32> {
        self.channel(name).map(|c| c.index)
    }

    /// Name of the channel at `index`
    pub fn resolve_index(&self, index: u32) -> Result<&str> {
        self.by_index
            .get(&index)
            .map(|&slot| self.channels[slot].name.as_str())
            .ok_or_else(|| DeviceError::UnknownChannel(format!("index {}", index)))
    }

    /// The named channel
    pub fn channel(&self, name: &str) -> Result<&Channel> {
        self.by_name
            .get(name)
            .map(|&slot| &self.channels[slot])
            .ok_or_else(|| DeviceError::UnknownChannel(name.to_string()))
    }

    /// Channels in configuration order
    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter()
    }

    /// Number of channels
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether the map has no channels
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Whether any channel can be read
    pub fn can_read(&self) -> bool {
        self.channels.iter().any(|c| c.direction.is_readable())
    }

    /// Whether any channel can be written
    pub fn can_write(&self) -> bool {
        self.channels.iter().any(|c| c.direction.is_writable())
    }

    /// Mask covering every channel
    pub fn full_mask(&self) -> u64 {
        self.channels.iter().fold(0, |mask, c| mask | c.bit())
    }

    /// Mask covering every readable channel
    pub fn readable_mask(&self) -> u64 {
        self.channels
            .iter()
            .filter(|c| c.direction.is_readable())
            .fold(0, |mask, c| mask | c.bit())
    }

    /// Fail with `DirectionViolation` unless every named channel is writable
    pub fn check_writable<I>(&self, names: I) -> Result<()>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        for name in names {
            let channel = self.channel(name.as_ref())?;
            if !channel.direction.is_writable() {
                return Err(DeviceError::DirectionViolation(format!(
                    "channel '{}' is an {} channel",
                    channel.name, channel.direction
                )));
            }
        }
        Ok(())
    }

    /// Encode a write: every named channel sets its bit in `mask`, channels
    /// in `high` also set it in `value`.
    ///
    /// A name listed in both sets ends up high.
    pub fn encode_mask<H, L>(&self, high: H, low: L) -> Result<(u64, u64)>
    where
        H: IntoIterator,
        H::Item: AsRef<str>,
        L: IntoIterator,
        L::Item: AsRef<str>,
    {
        let mut mask = 0;
        let mut value = 0;
        for name in high {
            let bit = self.channel(name.as_ref())?.bit();
            mask |= bit;
            value |= bit;
        }
        for name in low {
            mask |= self.channel(name.as_ref())?.bit();
        }
        Ok((mask, value))
    }

    /// Resolve the high and low sets to index lists
    pub fn encode_indices<H, L>(&self, high: H, low: L) -> Result<(Vec<u32>, Vec<u32>)>
    where
        H: IntoIterator,
        H::Item: AsRef<str>,
        L: IntoIterator,
        L::Item: AsRef<str>,
    {
        let high = high
            .into_iter()
            .map(|name| self.resolve(name.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        let low = low
            .into_iter()
            .map(|name| self.resolve(name.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok((high, low))
    }

    /// Decode a register value. Only channels whose bit is set in `mask`
    /// get an entry.
    pub fn decode_mask(&self, mask: u64, raw: u64) -> BTreeMap<String, bool> {
        self.channels
            .iter()
            .filter(|c| mask & c.bit() != 0)
            .map(|c| (c.name.clone(), raw & c.bit() != 0))
            .collect()
    }
}
