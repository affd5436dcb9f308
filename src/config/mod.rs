//! Configuration module
//!
//! Handles loading and saving PeerNet configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::network::ConnectionConfig;
use crate::protocol::{Network, NetworkProfile, MAX_MESSAGE_SIZE};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Network selection
    #[serde(default)]
    pub network: NetworkSection,

    /// Per-connection settings
    #[serde(default)]
    pub connection: ConnectionSection,

    /// Default peer
    #[serde(default)]
    pub peer: PeerSection,
}

/// Network selection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkSection {
    /// mainnet, testnet or regtest
    #[serde(default)]
    pub network: Network,
}

/// Connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSection {
    /// Connection timeout in ms
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Largest accepted payload; capped by the network profile
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Reject pending waiters when the peer closes the link
    #[serde(default)]
    pub reject_waiters_on_end: bool,
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_max_message_size() -> usize {
    MAX_MESSAGE_SIZE
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            max_message_size: default_max_message_size(),
            reject_waiters_on_end: false,
        }
    }
}

/// Peer configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerSection {
    /// `host` or `host:port`; the profile's port is used when omitted
    pub address: Option<String>,
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("peernet/config.toml")),
            Some(PathBuf::from("./peernet.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                tracing::debug!("Loading configuration from {}", path.display());
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Profile for the configured network
    pub fn profile(&self) -> NetworkProfile {
        NetworkProfile::for_network(self.network.network)
    }

    /// Settings handed to each new connection
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            connect_timeout_ms: self.connection.connect_timeout_ms,
            max_message_size: self.connection.max_message_size,
            reject_waiters_on_end: self.connection.reject_waiters_on_end,
        }
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        network: NetworkSection {
            network: Network::Testnet,
        },
        peer: PeerSection {
            address: Some("127.0.0.1:18333".to_string()),
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}
