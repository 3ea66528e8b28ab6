//! Configuration module
//!
//! Handles loading and saving client configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::network::{AddressError, MasterAddrList, NetworkConfig};
use crate::protocol::{
    default_client_id, RegistrationRequest, DEFAULT_MAX_PAYLOAD_SIZE, DEFAULT_PORT, NO_CHECKSUM,
};

/// Bounds for the response timeout, in milliseconds
pub const MIN_RESPONSE_TIMEOUT_MS: u64 = 8_000;
pub const MAX_RESPONSE_TIMEOUT_MS: u64 = 300_000;

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

    #[error("Invalid master address: {0}")]
    Address(#[from] AddressError),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Master settings
    #[serde(default)]
    pub master: MasterConfig,

    /// Client identity
    #[serde(default)]
    pub client: ClientConfig,
}

/// Master connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Comma separated `host:port` list
    #[serde(default = "default_addresses")]
    pub addresses: String,
    /// Connection timeout in ms
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Response timeout in ms
    #[serde(default = "default_response_timeout")]
    pub response_timeout_ms: u64,
    /// Largest payload sent to or accepted from the master
    #[serde(default = "default_max_payload_size")]
    pub max_payload_size: usize,
}

fn default_addresses() -> String {
    format!("127.0.0.1:{}", DEFAULT_PORT)
}

fn default_connect_timeout() -> u64 {
    30_000
}

fn default_response_timeout() -> u64 {
    15_000
}

fn default_max_payload_size() -> usize {
    DEFAULT_MAX_PAYLOAD_SIZE
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            addresses: default_addresses(),
            connect_timeout_ms: default_connect_timeout(),
            response_timeout_ms: default_response_timeout(),
            max_payload_size: default_max_payload_size(),
        }
    }
}

impl MasterConfig {
    pub fn master_addrs(&self) -> ConfigResult<MasterAddrList> {
        Ok(MasterAddrList::parse(&self.addresses)?)
    }

    /// Response timeout clamped to the accepted range
    pub fn response_timeout_ms(&self) -> u64 {
        self.response_timeout_ms
            .clamp(MIN_RESPONSE_TIMEOUT_MS, MAX_RESPONSE_TIMEOUT_MS)
    }
}

/// Client identity sent with each registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Address this client announces
    #[serde(default = "default_host_name")]
    pub host_name: String,
    /// Client id (defaults to `<host_name>-lan`)
    pub client_id: Option<String>,
    /// Topics to register for
    #[serde(default)]
    pub topics: Vec<String>,
    /// Last known broker checksum
    #[serde(default = "default_check_sum")]
    pub broker_check_sum: i64,
}

fn default_host_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "localhost".to_string())
}

fn default_check_sum() -> i64 {
    NO_CHECKSUM
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host_name: default_host_name(),
            client_id: None,
            topics: Vec::new(),
            broker_check_sum: default_check_sum(),
        }
    }
}

impl ClientConfig {
    /// Get the client id, deriving one from the host name if not set
    pub fn client_id(&self) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| default_client_id(&self.host_name))
    }
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
            dirs::config_dir().map(|p| p.join("tubeclient/config.toml")),
            Some(PathBuf::from("./tubeclient.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

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

    /// Runtime network settings derived from this file
    pub fn network_config(&self) -> NetworkConfig {
        NetworkConfig::default()
            .with_connect_timeout(self.master.connect_timeout_ms)
            .with_response_timeout(self.master.response_timeout_ms())
            .with_max_payload(self.master.max_payload_size)
    }

    /// Registration request for the configured identity
    pub fn registration_request(&self) -> RegistrationRequest {
        RegistrationRequest::new(self.client.host_name.clone())
            .with_client_id(self.client.client_id())
            .with_topics(self.client.topics.iter().cloned())
            .with_check_sum(self.client.broker_check_sum)
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        master: MasterConfig {
            addresses: "192.168.1.5:8000,192.168.1.6:8000".to_string(),
            ..Default::default()
        },
        client: ClientConfig {
            host_name: "192.168.1.11".to_string(),
            client_id: None,
            topics: vec!["demo".to_string()],
            broker_check_sum: NO_CHECKSUM,
        },
    };

    Ok(toml::to_string_pretty(&config)?)
}
