//! Configuration system for Tether.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $TETHER_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/tether/config.toml
//!   3. ~/.config/tether/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::wire::{DEFAULT_IPV4_PORT, DEFAULT_IPV6_GROUP};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub discovery: DiscoveryConfig,
    pub relays: RelaysConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// File holding this device's hex identifier. Generated on first run.
    pub device_id_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Listen URIs announced to peers. Wildcard hosts are filled in by the
    /// receiver from the announcement's source address.
    pub listen_addresses: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Announce and listen via IPv4 broadcast.
    pub ipv4_enabled: bool,
    /// UDP port for IPv4 broadcast announcements.
    pub ipv4_port: u16,
    /// Announce and listen via IPv6 multicast.
    pub ipv6_enabled: bool,
    /// IPv6 multicast group, as `[group]:port`.
    pub ipv6_group: String,
    /// Seconds between unforced announcements.
    pub broadcast_interval_secs: u64,
    /// Cached records older than this many cache lifetimes are evicted.
    /// 0 = never evict.
    pub eviction_factor: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaysConfig {
    /// Relay endpoints this device can be reached through.
    pub endpoints: Vec<RelayEndpoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayEndpoint {
    pub url: String,
    /// Last measured latency. Relays without a measurement are not announced.
    #[serde(default)]
    pub latency_ms: Option<u32>,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            device_id_path: config_dir().join("device_id"),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addresses: vec!["tcp://0.0.0.0:22000".to_string()],
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            ipv4_enabled: true,
            ipv4_port: DEFAULT_IPV4_PORT,
            ipv6_enabled: true,
            ipv6_group: DEFAULT_IPV6_GROUP.to_string(),
            broadcast_interval_secs: 30,
            eviction_factor: 4,
        }
    }
}

impl DiscoveryConfig {
    /// Bind specification for the IPv4 broadcast engine (`:port`).
    pub fn ipv4_bind(&self) -> String {
        format!(":{}", self.ipv4_port)
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_secs(self.broadcast_interval_secs.max(1))
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("tether")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl TetherConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_file(&Self::file_path())?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load a specific file, falling back to defaults if it does not exist.
    pub fn load_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("TETHER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&TetherConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply TETHER_* overrides. `lookup` is `std::env::var` in production.
    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("TETHER_DISCOVERY__IPV4_ENABLED") {
            self.discovery.ipv4_enabled = v == "true" || v == "1";
        }
        if let Some(p) = lookup("TETHER_DISCOVERY__IPV4_PORT").and_then(|v| v.parse().ok()) {
            self.discovery.ipv4_port = p;
        }
        if let Some(v) = lookup("TETHER_DISCOVERY__IPV6_ENABLED") {
            self.discovery.ipv6_enabled = v == "true" || v == "1";
        }
        if let Some(v) = lookup("TETHER_DISCOVERY__IPV6_GROUP") {
            self.discovery.ipv6_group = v;
        }
        if let Some(s) =
            lookup("TETHER_DISCOVERY__BROADCAST_INTERVAL_SECS").and_then(|v| v.parse().ok())
        {
            self.discovery.broadcast_interval_secs = s;
        }
        if let Some(v) = lookup("TETHER_NETWORK__LISTEN_ADDRESSES") {
            self.network.listen_addresses = v
                .split(',')
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(str::to_string)
                .collect();
        }
    }
}
