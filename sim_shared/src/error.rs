//! Startup-time configuration errors.
//!
//! Anything in here aborts startup; nothing is partially applied. Per-tick
//! failures are not errors at this level, see [`crate::schedule::SystemFault`].

use thiserror::Error;

use crate::net::{ChannelId, Delivery};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("system `{0}` registered twice")]
    DuplicateSystem(String),

    #[error("system `{system}` depends on unknown system `{target}`")]
    UnknownDependency { system: String, target: String },

    #[error("dependency cycle among active systems: {}", path.join(" -> "))]
    CyclicDependency { path: Vec<String> },

    #[error("channel `{channel}` already exists as {existing:?}, requested {requested:?}")]
    ChannelModeConflict {
        channel: ChannelId,
        existing: Delivery,
        requested: Delivery,
    },

    #[error("sync policy for `{component}` names channel `{channel}` which is not configured")]
    UnknownSyncChannel { component: String, channel: ChannelId },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("scheduler was ticked before build()")]
    NotBuilt,
}
