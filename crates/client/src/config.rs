//! Subscriber configuration management.
//!
//! Grounded on `rust-p2p-usb`'s `ClientConfig::load`/`validate`/`save` shape
//! (candidate-path search, XDG default, `validate()` pass), with the
//! USB-specific `[servers]`/`[iroh]` sections replaced by SPEC_FULL.md
//! §10's `[node]`/`[security]`/a subscriber-only `[subscribe]` section
//! carrying the URL prefixes to auto-subscribe to at startup.

use anyhow::{Context, Result, anyhow};
use protocol::TransportMode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriberConfig {
    pub node: NodeSettings,
    pub security: SecuritySettings,
    pub subscribe: SubscribeSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    pub log_level: String,
    /// Path to the secret key file for a stable `EndpointId`.
    /// If `None`, uses the default XDG path.
    #[serde(default)]
    pub secret_key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecuritySettings {
    /// Publishers/relays this subscriber will connect to. Empty means any.
    pub allowed_publishers: Vec<String>,
    pub require_approval: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeSettings {
    /// URL prefixes to issue a `SUBSCRIBE` for as soon as a publisher
    /// connection comes up.
    pub prefixes: Vec<String>,
    pub default_transport_mode: TransportModeConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportModeConfig {
    SingleStream,
    Datagram,
    Warp,
    Rush,
}

impl From<TransportModeConfig> for TransportMode {
    fn from(value: TransportModeConfig) -> Self {
        match value {
            TransportModeConfig::SingleStream => TransportMode::SingleStream,
            TransportModeConfig::Datagram => TransportMode::Datagram,
            TransportModeConfig::Warp => TransportMode::Warp,
            TransportModeConfig::Rush => TransportMode::Rush,
        }
    }
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            node: NodeSettings {
                log_level: "info".to_string(),
                secret_key_path: None,
            },
            security: SecuritySettings {
                allowed_publishers: Vec::new(),
                require_approval: false,
            },
            subscribe: SubscribeSettings {
                prefixes: Vec::new(),
                default_transport_mode: TransportModeConfig::Warp,
            },
        }
    }
}

impl SubscriberConfig {
    /// Load configuration from the specified path, the XDG default, or
    /// `/etc/media-quic/subscriber.toml`, in that order.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/media-quic/subscriber.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: SubscriberConfig = toml::from_str(&content)
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
            config_dir.join("media-quic").join("subscriber.toml")
        } else {
            PathBuf::from(".config/media-quic/subscriber.toml")
        }
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

        for publisher_id in &self.security.allowed_publishers {
            if publisher_id.is_empty() {
                return Err(anyhow!("Empty publisher id in allowed_publishers list"));
            }
        }

        for prefix in &self.subscribe.prefixes {
            if prefix.is_empty() {
                return Err(anyhow!("Empty URL prefix in subscribe.prefixes list"));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_no_auto_subscriptions() {
        let config = SubscriberConfig::default();
        assert_eq!(config.node.log_level, "info");
        assert!(config.subscribe.prefixes.is_empty());
    }

    #[test]
    fn config_round_trips_through_toml() {
        let config = SubscriberConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: SubscriberConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(config.node.log_level, parsed.node.log_level);
        assert_eq!(
            config.subscribe.default_transport_mode,
            parsed.subscribe.default_transport_mode
        );
    }

    #[test]
    fn validate_rejects_invalid_log_level() {
        let mut config = SubscriberConfig::default();
        assert!(config.validate().is_ok());

        config.node.log_level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_prefix() {
        let mut config = SubscriberConfig::default();
        config.subscribe.prefixes.push(String::new());
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_allowed_publisher() {
        let mut config = SubscriberConfig::default();
        config.security.allowed_publishers.push(String::new());
        assert!(config.validate().is_err());
    }
}
