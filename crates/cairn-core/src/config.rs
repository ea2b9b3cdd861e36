//! Configuration system for cairn.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $CAIRN_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/cairn/config.toml
//!   3. ~/.config/cairn/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CairnConfig {
    /// Client version string announced in the hello exchange.
    pub client_version: String,
    pub network: NetworkPreferences,
}

/// Everything the Host needs to know about the network environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkPreferences {
    /// TCP port to accept sessions on. 0 = OS-assigned.
    pub listen_port: u16,
    /// Publicly advertised IP. Empty = determine automatically.
    pub advertised_ip: String,
    /// Attempt NAT traversal when no public interface address is found.
    pub upnp: bool,
    /// Allow private (RFC 1918) addresses as publishable endpoints.
    pub local_networking: bool,
    /// Target number of live sessions the dialer aims for.
    pub ideal_peers: u32,
    /// Directory holding the identity file and other node state.
    pub data_dir: PathBuf,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for CairnConfig {
    fn default() -> Self {
        Self {
            client_version: format!("cairn/{}", env!("CARGO_PKG_VERSION")),
            network: NetworkPreferences::default(),
        }
    }
}

impl Default for NetworkPreferences {
    fn default() -> Self {
        Self {
            listen_port: 30303,
            advertised_ip: String::new(),
            upnp: false,
            local_networking: false,
            ideal_peers: 5,
            data_dir: data_dir(),
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("cairn")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("cairn")
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

impl CairnConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            CairnConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("CAIRN_CONFIG")
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
            let text = toml::to_string_pretty(&CairnConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text)
                .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply CAIRN_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CAIRN_NETWORK__LISTEN_PORT") {
            if let Ok(p) = v.parse() {
                self.network.listen_port = p;
            }
        }
        if let Ok(v) = std::env::var("CAIRN_NETWORK__ADVERTISED_IP") {
            self.network.advertised_ip = v;
        }
        if let Ok(v) = std::env::var("CAIRN_NETWORK__UPNP") {
            self.network.upnp = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("CAIRN_NETWORK__LOCAL_NETWORKING") {
            self.network.local_networking = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("CAIRN_NETWORK__IDEAL_PEERS") {
            if let Ok(n) = v.parse() {
                self.network.ideal_peers = n;
            }
        }
        if let Ok(v) = std::env::var("CAIRN_NETWORK__DATA_DIR") {
            self.network.data_dir = PathBuf::from(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = CairnConfig::default();
        assert_eq!(config.network.listen_port, 30303);
        assert_eq!(config.network.ideal_peers, 5);
        assert!(config.network.advertised_ip.is_empty());
        assert!(!config.network.upnp);
        assert!(!config.network.local_networking);
        assert!(config.client_version.starts_with("cairn/"));
    }

    #[test]
    fn config_round_trips_through_toml() {
        let mut config = CairnConfig::default();
        config.network.listen_port = 30301;
        config.network.advertised_ip = "198.51.100.4".into();
        config.network.ideal_peers = 25;

        let text = toml::to_string_pretty(&config).unwrap();
        let back: CairnConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.network.listen_port, 30301);
        assert_eq!(back.network.advertised_ip, "198.51.100.4");
        assert_eq!(back.network.ideal_peers, 25);
    }

    #[test]
    fn partial_file_fills_with_defaults() {
        let config: CairnConfig = toml::from_str("[network]\nlisten_port = 30305\n").unwrap();
        assert_eq!(config.network.listen_port, 30305);
        assert_eq!(config.network.ideal_peers, 5);
    }
}
