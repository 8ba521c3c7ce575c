//! Configuration for the signaling relay

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Default relay listener address
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:3000";

/// Relay server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Address the WebSocket listener binds to (default: 0.0.0.0:3000)
    pub bind_address: String,

    /// Per-connection outbound queue bound (default: 256)
    ///
    /// Messages to a connection whose queue is full are dropped.
    pub outbound_queue: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            outbound_queue: 256,
        }
    }
}

impl RelayConfig {
    /// Config listening on `bind_address` with default limits
    pub fn with_bind_address(mut self, bind_address: impl Into<String>) -> Self {
        self.bind_address = bind_address.into();
        self
    }

    /// Parsed listener address
    pub fn socket_addr(&self) -> crate::Result<SocketAddr> {
        self.bind_address.parse().map_err(|_| {
            crate::Error::InvalidConfig(format!(
                "bind_address must be host:port, got {}",
                self.bind_address
            ))
        })
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `bind_address` is not a socket address
    /// - `outbound_queue` is not in range 1-65536
    pub fn validate(&self) -> crate::Result<()> {
        self.socket_addr()?;

        if self.outbound_queue == 0 || self.outbound_queue > 65536 {
            return Err(crate::Error::InvalidConfig(format!(
                "outbound_queue must be in range 1-65536, got {}",
                self.outbound_queue
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RelayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.socket_addr().unwrap().port(), 3000);
    }

    #[test]
    fn test_invalid_bind_address() {
        let config = RelayConfig::default().with_bind_address("localhost");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_queue_bound() {
        let config = RelayConfig {
            outbound_queue: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
