//! Mesh node configuration
//!
//! Configuration is plain data with serde support so it can be loaded from a
//! JSON file. Every field has a default, and a partial file only overrides
//! the fields it names.

use crate::mesh::airtime::ModemPreset;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Maximum number of peer records kept in the node database
pub const DEFAULT_MAX_NODES: usize = 64;

/// Total transmission attempts for a reliable packet (initial send included)
pub const NUM_RETRANSMISSIONS: u8 = 3;

/// A node heard within this many seconds counts as online (two minutes).
pub const NUM_ONLINE_SECS: u32 = 60 * 2;

/// Default hop limit for packets we originate
pub const HOP_RELIABLE: u8 = 3;

/// How long a packet stays in the flood duplicate history (milliseconds)
pub const FLOOD_EXPIRE_TIME_MS: u64 = 10 * 60 * 1000;

/// Errors loading a configuration file
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error reading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Configuration for mesh node behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Capacity of the node database
    pub max_nodes: usize,
    /// Total attempts for reliable sends
    pub num_retransmissions: u8,
    /// Online threshold used by `MeshService::num_online_nodes`
    pub online_threshold_secs: u32,
    /// Hop limit for locally originated packets
    pub hop_limit: u8,
    /// Lifetime of entries in the flood duplicate history
    pub flood_expire_ms: u64,
    /// Maximum entries in the flood duplicate history
    pub dedup_capacity: usize,
    /// Development mode: never write state to storage
    pub no_save: bool,
    /// Where the device state is persisted, if anywhere
    pub state_path: Option<PathBuf>,
    /// Modem preset used for airtime estimation
    pub modem_preset: ModemPreset,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            max_nodes: DEFAULT_MAX_NODES,
            num_retransmissions: NUM_RETRANSMISSIONS,
            online_threshold_secs: NUM_ONLINE_SECS,
            hop_limit: HOP_RELIABLE,
            flood_expire_ms: FLOOD_EXPIRE_TIME_MS,
            dedup_capacity: 256,
            no_save: false,
            state_path: None,
            modem_preset: ModemPreset::default(),
        }
    }
}

impl MeshConfig {
    /// Load a configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Parse a configuration from JSON text.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: MeshConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the core cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_nodes == 0 {
            return Err(ConfigError::Invalid {
                field: "max_nodes",
                reason: "node database needs room for at least the local node".into(),
            });
        }
        if self.num_retransmissions == 0 {
            return Err(ConfigError::Invalid {
                field: "num_retransmissions",
                reason: "must allow at least the initial send".into(),
            });
        }
        if self.hop_limit > 7 {
            return Err(ConfigError::Invalid {
                field: "hop_limit",
                reason: format!("{} exceeds the 3-bit hop field", self.hop_limit),
            });
        }
        Ok(())
    }
}
