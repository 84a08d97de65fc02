//! Daemon configuration file.
//!
//! A single JSON document: the peer's [`BeaconConfig`] fields at the top level
//! plus a `transport` section. Every field is optional.
//!
//! ```json
//! {
//!   "channelName": "jobs",
//!   "staleThresholdMs": 5000,
//!   "transport": { "kind": "udp", "port": 45454 }
//! }
//! ```

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use beacon_core::BeaconConfig;
use serde::{Deserialize, Serialize};

use crate::udp::{DEFAULT_GROUP, DEFAULT_PORT};

/// Which broadcast medium to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// UDP multicast, falling back to the store when it cannot be opened
    #[default]
    Auto,
    /// UDP multicast only
    Udp,
    /// Directory-backed store only
    Store,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportSettings {
    #[serde(default)]
    pub kind: TransportKind,

    /// Multicast group (default: 239.255.42.99)
    #[serde(default = "default_group")]
    pub group: Ipv4Addr,

    /// Multicast port (default: 45454)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Directory for the store transport (default: system temp dir)
    pub store_dir: Option<PathBuf>,

    /// How long store messages are kept before pruning (default: 10s)
    #[serde(default = "default_store_ttl")]
    pub store_ttl_ms: u64,
}

fn default_group() -> Ipv4Addr {
    DEFAULT_GROUP
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_store_ttl() -> u64 {
    10_000
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            kind: TransportKind::default(),
            group: default_group(),
            port: default_port(),
            store_dir: None,
            store_ttl_ms: default_store_ttl(),
        }
    }
}

impl TransportSettings {
    /// Store directory, defaulting to `<tmp>/beacon`.
    pub fn store_dir(&self) -> PathBuf {
        self.store_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("beacon"))
    }
}

/// Full daemon settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(flatten)]
    pub beacon: BeaconConfig,

    #[serde(default)]
    pub transport: TransportSettings,

    /// Fixed peer ID (generated when absent)
    pub peer_id: Option<String>,

    /// Send a leader-directed `ping` this often
    pub ping_interval_ms: Option<u64>,
}

impl Settings {
    /// Load settings from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let settings: Settings = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        tracing::info!("Loaded configuration from {:?}", path);
        Ok(settings)
    }

    /// Load from `path` if given, otherwise start from defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}
