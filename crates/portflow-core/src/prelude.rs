/*!
 * Prelude module for portflow core.
 *
 * Commonly used types and functions, re-exported for a single glob import.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export core types
pub use crate::types::{Direction, Id, ReleaseMode, Timestamp};

// Re-export event types
pub use crate::event::{Event, EventBus, SharedEventBus, Subscriber};

// Re-export config types
pub use crate::config::{
    ChannelConfig, Config, ConfigBuilder, DeviceConfig, DeviceKind, LineConfig,
};

// Re-export utility functions
pub use crate::utils::with_timeout;

// Re-export logging macros
pub use tracing::{debug, error, info, trace, warn};

// Re-export core initialization
pub use crate::{init, init_with_config};
