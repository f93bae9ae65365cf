//! Server configuration types
//!
//! Defines the main configuration structures for the relay server.

use super::UdpConfig;
use crate::error::RelayError;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Default client-facing listen address
fn default_listen_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 3478)
}

/// Default relay bind IP
fn default_relay_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

/// Default allocation lifetime in seconds
fn default_lifetime() -> u64 {
    600
}

/// Default maximum allocation lifetime in seconds
fn default_max_lifetime() -> u64 {
    3600
}

/// Root configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
}

/// Relay server configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    /// Client-facing listen address (e.g., "0.0.0.0:3478")
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// IP relay conns are bound to
    #[serde(default = "default_relay_ip")]
    pub relay_ip: IpAddr,

    /// Lifetime in seconds granted when a request names none
    #[serde(default = "default_lifetime")]
    pub default_lifetime: u64,

    /// Upper bound in seconds on any granted lifetime
    #[serde(default = "default_max_lifetime")]
    pub max_lifetime: u64,

    /// UDP socket configuration
    #[serde(default)]
    pub udp: UdpConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen_addr: default_listen_addr(),
            relay_ip: default_relay_ip(),
            default_lifetime: default_lifetime(),
            max_lifetime: default_max_lifetime(),
            udp: UdpConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.default_lifetime == 0 {
            return Err(RelayError::Config(
                "default_lifetime must be greater than 0".to_string(),
            ));
        }
        if self.default_lifetime > self.max_lifetime {
            return Err(RelayError::Config(
                "default_lifetime cannot be greater than max_lifetime".to_string(),
            ));
        }
        self.udp.validate()
    }

    /// Lifetime granted for a requested one
    ///
    /// No request gets the default; anything longer than the maximum is
    /// capped. A zero request is passed through so the caller can treat it
    /// as a delete.
    pub fn clamp_lifetime(&self, requested: Option<Duration>) -> Duration {
        let max = Duration::from_secs(self.max_lifetime);
        match requested {
            Some(lifetime) => lifetime.min(max),
            None => Duration::from_secs(self.default_lifetime),
        }
    }
}
