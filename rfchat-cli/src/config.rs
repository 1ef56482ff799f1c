//! Load config from file and environment.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::radio::lan::LanSettings;

/// Chat configuration. File: `--config`, ~/.config/rfchat/config.toml or /etc/rfchat/config.toml.
/// Env overrides: RFCHAT_DEVICE_NAME, RFCHAT_DISCOVERY_PORT, RFCHAT_MULTICAST_GROUP, RFCHAT_CHANNEL_PORT.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Name shown to other devices (default: host name).
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// Presence beacon UDP port (default 45680).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    #[serde(default = "default_multicast_group")]
    pub multicast_group: Ipv4Addr,
    /// Stream TCP port while listening; 0 = ephemeral.
    #[serde(default)]
    pub channel_port: u16,
    #[serde(default = "default_beacon_interval_ms")]
    pub beacon_interval_ms: u64,
    /// Devices silent this long are removed.
    #[serde(default = "default_peer_timeout_ms")]
    pub peer_timeout_ms: u64,
    /// Unanswered service queries count as "not offered" after this long.
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
}

fn default_device_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_owned())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "rfchat".to_owned())
}
fn default_discovery_port() -> u16 {
    45680
}
fn default_multicast_group() -> Ipv4Addr {
    Ipv4Addr::new(239, 255, 60, 61)
}
fn default_beacon_interval_ms() -> u64 {
    2000
}
fn default_peer_timeout_ms() -> u64 {
    8000
}
fn default_query_timeout_ms() -> u64 {
    3000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            discovery_port: default_discovery_port(),
            multicast_group: default_multicast_group(),
            channel_port: 0,
            beacon_interval_ms: default_beacon_interval_ms(),
            peer_timeout_ms: default_peer_timeout_ms(),
            query_timeout_ms: default_query_timeout_ms(),
        }
    }
}

impl Config {
    pub fn lan_settings(&self) -> LanSettings {
        LanSettings {
            device_name: self.device_name.clone(),
            discovery_port: self.discovery_port,
            multicast_group: self.multicast_group,
            channel_port: self.channel_port,
            beacon_interval: Duration::from_millis(self.beacon_interval_ms),
            peer_timeout: Duration::from_millis(self.peer_timeout_ms),
            query_timeout: Duration::from_millis(self.query_timeout_ms),
        }
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(name) = var("RFCHAT_DEVICE_NAME").filter(|n| !n.trim().is_empty()) {
            self.device_name = name;
        }
        if let Some(p) = var("RFCHAT_DISCOVERY_PORT").and_then(|s| s.parse().ok()) {
            self.discovery_port = p;
        }
        if let Some(g) = var("RFCHAT_MULTICAST_GROUP").and_then(|s| s.parse().ok()) {
            self.multicast_group = g;
        }
        if let Some(p) = var("RFCHAT_CHANNEL_PORT").and_then(|s| s.parse().ok()) {
            self.channel_port = p;
        }
    }
}

/// Load config: explicit path if given (must exist and parse), else the first
/// standard file found, else defaults; then env vars.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(path) => read(path)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => read(&path)?,
            None => Config::default(),
        },
    };
    c.apply_env(|k| std::env::var(k).ok());
    Ok(c)
}

fn read(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing config {}", path.display()))
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/rfchat/config.toml"));
    }
    out.push(PathBuf::from("/etc/rfchat/config.toml"));
    out
}
