//! Network module - Handles TCP communication with the master
//!
//! Provides:
//! - Framed connection with a background receive task
//! - Registration client driving the connect/register lifecycle
//! - Master address list parsing and resolution

mod client;
mod connection;

pub use client::*;
pub use connection::*;

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use thiserror::Error;

use crate::protocol::DEFAULT_MAX_PAYLOAD_SIZE;

/// Configuration for network operations
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// How long to wait for the master's response in milliseconds
    pub response_timeout_ms: u64,
    /// Largest payload in either direction; an inbound frame over it drops
    /// the connection, an outbound one is refused before writing
    pub max_payload_size: usize,
    /// Capacity of the unsolicited frame channel
    pub unsolicited_capacity: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 30_000,
            response_timeout_ms: 15_000,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            unsolicited_capacity: 64,
        }
    }
}

impl NetworkConfig {
    pub fn with_connect_timeout(mut self, connect_timeout_ms: u64) -> Self {
        self.connect_timeout_ms = connect_timeout_ms;
        self
    }

    pub fn with_response_timeout(mut self, response_timeout_ms: u64) -> Self {
        self.response_timeout_ms = response_timeout_ms;
        self
    }

    pub fn with_max_payload(mut self, max_payload_size: usize) -> Self {
        self.max_payload_size = max_payload_size;
        self
    }
}

/// Errors from parsing master addresses
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Master address list is empty")]
    Empty,

    #[error("Missing port in master address: {0}")]
    MissingPort(String),

    #[error("Invalid port in master address: {0}")]
    InvalidPort(String),

    #[error("Missing host in master address: {0}")]
    MissingHost(String),
}

/// A single master endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterAddr {
    pub host: String,
    pub port: u16,
}

impl MasterAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Resolve to a socket address
    pub async fn resolve(&self) -> std::io::Result<SocketAddr> {
        resolve_host(&self.host, self.port).await
    }
}

impl fmt::Display for MasterAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for MasterAddr {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| AddressError::MissingPort(s.to_string()))?;

        let host = host.trim();
        if host.is_empty() {
            return Err(AddressError::MissingHost(s.to_string()));
        }

        let port = port
            .trim()
            .parse::<u16>()
            .map_err(|_| AddressError::InvalidPort(s.to_string()))?;

        Ok(Self::new(host, port))
    }
}

/// Comma separated list of master endpoints, e.g. `"10.0.0.1:8000,10.0.0.2:8000"`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterAddrList {
    addrs: Vec<MasterAddr>,
}

impl MasterAddrList {
    pub fn parse(list: &str) -> Result<Self, AddressError> {
        let addrs = list
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(MasterAddr::from_str)
            .collect::<Result<Vec<_>, _>>()?;

        if addrs.is_empty() {
            return Err(AddressError::Empty);
        }

        Ok(Self { addrs })
    }

    pub fn iter(&self) -> impl Iterator<Item = &MasterAddr> {
        self.addrs.iter()
    }

    pub fn first(&self) -> &MasterAddr {
        &self.addrs[0]
    }

}

impl fmt::Display for MasterAddrList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<String> = self.addrs.iter().map(ToString::to_string).collect();
        write!(f, "{}", joined.join(","))
    }
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}
