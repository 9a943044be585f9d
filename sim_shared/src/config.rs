//! Configuration system.
//!
//! Loads engine configuration from JSON strings/files.

use std::{collections::HashMap, path::Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{
    error::ConfigError,
    net::{channels, ChannelId, Delivery, NetworkChannel},
    queues::OverflowPolicy,
    schedule::Side,
};

/// One configured network channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    pub mode: Delivery,
}

impl ChannelConfig {
    pub fn new(name: &str, mode: Delivery) -> Self {
        Self {
            name: name.to_string(),
            mode,
        }
    }

    pub fn to_channel(&self) -> NetworkChannel {
        match self.mode {
            Delivery::Reliable => NetworkChannel::reliable(self.name.clone()),
            Delivery::Unreliable => NetworkChannel::unreliable(self.name.clone()),
        }
    }
}

/// Root configuration shared by client/server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Fixed simulation tick rate.
    #[serde(default = "default_tick_hz")]
    pub tick_hz: u32,
    #[serde(default = "default_role")]
    pub role: Side,
    /// Per staging queue; 0 = unbounded.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub overflow: OverflowPolicy,
    #[serde(default = "default_channels")]
    pub channels: Vec<ChannelConfig>,
    /// Ticks between periodic saves of every online player; 0 disables.
    #[serde(default = "default_autosave_ticks")]
    pub autosave_ticks: u64,
    /// Component name -> rate in ticks.
    #[serde(default)]
    pub sync_rate_overrides: HashMap<String, u32>,
}

fn default_tick_hz() -> u32 {
    30
}

fn default_role() -> Side {
    Side::Server
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_autosave_ticks() -> u64 {
    300
}

fn default_channels() -> Vec<ChannelConfig> {
    vec![
        ChannelConfig::new(channels::SESSION, Delivery::Reliable),
        ChannelConfig::new(channels::TRANSFORM, Delivery::Unreliable),
        ChannelConfig::new(channels::VITALS, Delivery::Reliable),
        ChannelConfig::new(channels::COMBAT, Delivery::Reliable),
        ChannelConfig::new(channels::INPUT, Delivery::Unreliable),
    ]
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_hz: default_tick_hz(),
            role: default_role(),
            queue_capacity: default_queue_capacity(),
            overflow: OverflowPolicy::default(),
            channels: default_channels(),
            autosave_ticks: default_autosave_ticks(),
            sync_rate_overrides: HashMap::new(),
        }
    }
}

impl EngineConfig {
    /// Defaults for the given role.
    pub fn for_role(role: Side) -> Self {
        Self {
            role,
            ..Self::default()
        }
    }

    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Reads, parses and validates a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let cfg = Self::from_json_str(&text)
            .with_context(|| format!("parse config {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_hz == 0 {
            return Err(ConfigError::InvalidConfig("tick_hz must be > 0".into()));
        }
        let mut seen: HashMap<&str, Delivery> = HashMap::new();
        for ch in &self.channels {
            if ch.name.is_empty() {
                return Err(ConfigError::InvalidConfig("channel name is empty".into()));
            }
            if let Some(existing) = seen.insert(&ch.name, ch.mode) {
                if existing != ch.mode {
                    return Err(ConfigError::ChannelModeConflict {
                        channel: ChannelId::new(ch.name.clone()),
                        existing,
                        requested: ch.mode,
                    });
                }
            }
        }
        Ok(())
    }

    /// Fixed timestep in seconds.
    pub fn dt(&self) -> f32 {
        1.0 / self.tick_hz.max(1) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_takes_defaults() {
        let cfg = EngineConfig::from_json_str("{}").unwrap();
        assert_eq!(cfg.tick_hz, 30);
        assert_eq!(cfg.role, Side::Server);
        assert_eq!(cfg.queue_capacity, 1024);
        assert_eq!(cfg.autosave_ticks, 300);
        assert_eq!(cfg.channels.len(), 5);
        cfg.validate().unwrap();
    }

    #[test]
    fn parses_overrides() {
        let cfg = EngineConfig::from_json_str(
            r#"{"tick_hz": 20, "role": "client", "overflow": "drop_newest",
                "channels": [{"name": "input", "mode": "unreliable"}],
                "sync_rate_overrides": {"vitals": 10}}"#,
        )
        .unwrap();
        assert_eq!(cfg.role, Side::Client);
        assert_eq!(cfg.overflow, OverflowPolicy::DropNewest);
        assert_eq!(cfg.sync_rate_overrides.get("vitals"), Some(&10));
        assert_eq!(cfg.channels, vec![ChannelConfig::new("input", Delivery::Unreliable)]);
    }

    #[test]
    fn zero_tick_rate_is_rejected() {
        let cfg = EngineConfig {
            tick_hz: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn conflicting_channel_modes_are_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.channels
            .push(ChannelConfig::new(channels::VITALS, Delivery::Unreliable));
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::ChannelModeConflict { .. })
        ));
    }
}
