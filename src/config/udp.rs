//! UDP socket configuration

use crate::error::RelayError;
use serde::{Deserialize, Serialize};

/// Smallest socket buffer accepted
const MIN_BUFFER_SIZE: usize = 1024;

/// UDP socket configuration, applied to the listen socket and relay conns
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct UdpConfig {
    /// SO_RCVBUF size in bytes (OS default when unset)
    #[serde(default)]
    pub recv_buffer_size: Option<usize>,

    /// SO_SNDBUF size in bytes (OS default when unset)
    #[serde(default)]
    pub send_buffer_size: Option<usize>,
}

impl UdpConfig {
    /// Validate the UDP configuration
    pub fn validate(&self) -> Result<(), RelayError> {
        for (name, size) in [
            ("recv_buffer_size", self.recv_buffer_size),
            ("send_buffer_size", self.send_buffer_size),
        ] {
            if matches!(size, Some(size) if size < MIN_BUFFER_SIZE) {
                return Err(RelayError::Config(format!(
                    "{} must be at least {} bytes",
                    name, MIN_BUFFER_SIZE
                )));
            }
        }
        Ok(())
    }
}
