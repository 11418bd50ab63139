//! src/config.rs
//!
//! Defines the strongly-typed `Config` struct for all runtime parameters,
//! loaded from files and environment variables via `figment`.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Top-level struct holding all application configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Identity profile file (created on first start).
    pub profile_path: PathBuf,
    /// SQLite message store.
    pub db_path: PathBuf,
    /// Display name recorded in the profile on first start.
    pub display_name: String,
    /// TCP listen address; port 0 requests an OS-chosen ephemeral port.
    pub bind_addr: SocketAddr,
    /// Outbound connect timeout.
    pub connect_timeout_ms: u64,
    /// Wire frame cap. The original proof of concept shipped 1 KiB; sealed
    /// invite envelopes alone approach that, so the default is 64 KiB.
    pub max_frame_bytes: usize,
    /// Hop budget stamped on locally originated envelopes.
    pub initial_ttl: u8,
    /// Capacity of the gossip dedup window.
    pub seen_capacity: usize,
    /// mDNS advertisement; `None` disables discovery (degraded mode: no
    /// new peers, manual peering still works).
    pub discovery: Option<DiscoveryConfig>,
}

/// Configuration for the local-link discovery service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    pub service_type: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service_type: "_meshchat._tcp.local.".to_string(),
        }
    }
}

impl Config {
    /// Loads configuration from `meshchat.toml` and environment variables.
    /// It uses the `Default` implementation as a base layer.
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file("meshchat.toml"))
            .merge(Env::prefixed("MESHCHAT_"))
            .extract()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            profile_path: PathBuf::from("profile.json"),
            db_path: PathBuf::from("meshchat.db"),
            display_name: "anonymous".to_string(),
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), 0),
            connect_timeout_ms: 5000,
            max_frame_bytes: 65536,
            initial_ttl: 3,
            seen_capacity: 1000,
            discovery: Some(DiscoveryConfig::default()),
        }
    }
}
