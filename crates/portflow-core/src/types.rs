/*!
 * Core data types for portflow.
 *
 * Identifiers, timestamps and the small enums that configuration and the
 * device crate both need to agree on.
 */
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Point in time at which hardware confirmed a value
pub type Timestamp = DateTime<Utc>;

/// A unique identifier for devices and other portflow resources
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Id(String);

impl Id {
    /// Create a new ID with a random UUID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create an ID from a string
    pub fn from_string<S: AsRef<str>>(s: S) -> Self {
        Self(s.as_ref().to_string())
    }

    /// Get the string representation of the ID
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for Id {
    fn from(s: &str) -> Self {
        Self::from_string(s)
    }
}

impl From<String> for Id {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Direction of a physical channel as seen from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// The host reads the channel
    Input,
    /// The host drives the channel
    Output,
    /// The host both drives and reads back the channel
    Bidirectional,
}

impl Direction {
    /// Whether values can be read from a channel with this direction
    pub fn is_readable(self) -> bool {
        matches!(self, Direction::Input | Direction::Bidirectional)
    }

    /// Whether values can be written to a channel with this direction
    pub fn is_writable(self) -> bool {
        matches!(self, Direction::Output | Direction::Bidirectional)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Direction::Input => "input",
            Direction::Output => "output",
            Direction::Bidirectional => "bidirectional",
        };
        f.write_str(s)
    }
}

/// How a device reports the end of a deactivation whose read subscription is
/// still draining through the request queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseMode {
    /// Stay `deactivating` until the queue has drained the old subscription.
    /// Activation is refused in the meantime.
    #[default]
    Deferred,
    /// Report `inactive` at once. A re-activation during the drain is
    /// remembered and the subscription restarts once the drain completes.
    Immediate,
}
