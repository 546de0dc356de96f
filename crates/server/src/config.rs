//! Publisher/relay configuration management.
//!
//! Grounded on `rust-p2p-usb`'s `ServerConfig::load`/`validate`/`save`
//! shape (candidate-path search, XDG default, `validate()` pass), with the
//! USB-specific `[usb]`/`[security.require_approval]` sections replaced by
//! SPEC_FULL.md §10's `[node]`/`[security]`/`[relay]`/`[congestion]`.

use anyhow::{Context, Result, anyhow};
use media_core::CongestionMode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub node: NodeSettings,
    pub security: SecuritySettings,
    pub relay: RelaySettings,
    pub congestion: CongestionSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    pub bind_addr: Option<String>,
    pub log_level: String,
    /// Path to the secret key file for a stable `EndpointId`.
    /// If `None`, uses the default XDG path.
    #[serde(default)]
    pub secret_key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecuritySettings {
    pub allowed_peers: Vec<String>,
    pub require_approval: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySettings {
    /// When non-empty, this node relays rather than originates: each entry
    /// is an upstream publisher/relay to `POST` toward.
    pub upstreams: Vec<String>,
    pub cache_policy: CachePolicyConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CachePolicyConfig {
    Default,
    RealTime,
}

impl From<CachePolicyConfig> for protocol::CachePolicy {
    fn from(value: CachePolicyConfig) -> Self {
        match value {
            CachePolicyConfig::Default => protocol::CachePolicy::Default,
            CachePolicyConfig::RealTime => protocol::CachePolicy::RealTime,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CongestionSettings {
    pub mode: CongestionModeConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CongestionModeConfig {
    None,
    Delay,
    Group,
    Zero,
}

impl From<CongestionModeConfig> for CongestionMode {
    fn from(value: CongestionModeConfig) -> Self {
        match value {
            CongestionModeConfig::None => CongestionMode::None,
            CongestionModeConfig::Delay => CongestionMode::Delay,
            CongestionModeConfig::Group => CongestionMode::Group,
            CongestionModeConfig::Zero => CongestionMode::Zero,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            node: NodeSettings {
                bind_addr: Some("0.0.0.0:4433".to_string()),
                log_level: "info".to_string(),
                secret_key_path: None,
            },
            security: SecuritySettings {
                allowed_peers: Vec::new(),
                require_approval: true,
            },
            relay: RelaySettings {
                upstreams: Vec::new(),
                cache_policy: CachePolicyConfig::Default,
            },
            congestion: CongestionSettings {
                mode: CongestionModeConfig::None,
            },
        }
    }
}

impl ServerConfig {
    /// Load configuration from the specified path, the XDG default, or
    /// `/etc/media-quic/server.toml`, in that order.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![Self::default_path(), PathBuf::from("/etc/media-quic/server.toml")];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: ServerConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found.
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// The default configuration file path under the XDG config directory.
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("media-quic").join("server.toml")
        } else {
            PathBuf::from(".config/media-quic/server.toml")
        }
    }

    /// True when `[relay].upstreams` is non-empty: this node relays rather
    /// than only originating locally published sources.
    pub fn is_relay(&self) -> bool {
        !self.relay.upstreams.is_empty()
    }

    fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.node.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.node.log_level,
                valid_levels.join(", ")
            ));
        }

        for peer_id in &self.security.allowed_peers {
            if peer_id.is_empty() {
                return Err(anyhow!("Empty peer id in allowed_peers list"));
            }
        }

        for upstream in &self.relay.upstreams {
            if upstream.is_empty() {
                return Err(anyhow!("Empty upstream URL in relay.upstreams list"));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_not_a_relay() {
        let config = ServerConfig::default();
        assert_eq!(config.node.log_level, "info");
        assert!(config.security.require_approval);
        assert!(!config.is_relay());
    }

    #[test]
    fn relay_upstreams_flip_is_relay() {
        let mut config = ServerConfig::default();
        config.relay.upstreams.push("media/upstream".to_string());
        assert!(config.is_relay());
    }

    #[test]
    fn config_round_trips_through_toml() {
        let config = ServerConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: ServerConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(config.node.log_level, parsed.node.log_level);
        assert_eq!(config.security.require_approval, parsed.security.require_approval);
    }

    #[test]
    fn validate_rejects_invalid_log_level() {
        let mut config = ServerConfig::default();
        assert!(config.validate().is_ok());

        config.node.log_level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_allowed_peer() {
        let mut config = ServerConfig::default();
        config.security.allowed_peers.push(String::new());
        assert!(config.validate().is_err());
    }
}
