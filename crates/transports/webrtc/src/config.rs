//! Configuration for the negotiation engines

use crate::lifecycle::ReconnectionPolicy;
use serde::{Deserialize, Serialize};

/// Label of the data channel carrying metadata updates
pub const METADATA_CHANNEL_LABEL: &str = "metadata";

/// Configuration shared by the broadcaster and viewer engines
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationConfig {
    /// Relay URL (ws:// or wss://)
    pub signaling_url: String,

    /// STUN server URLs
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Viewer identity (auto-generated if None)
    pub peer_id: Option<String>,

    /// Label of the metadata data channel (default: "metadata")
    pub metadata_label: String,

    /// Viewer session replacement policy
    pub reconnect: ReconnectionPolicy,
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn: or turns:)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            signaling_url: "wss://localhost:3000".to_string(),
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
            peer_id: None,
            metadata_label: METADATA_CHANNEL_LABEL.to_string(),
            reconnect: ReconnectionPolicy::default(),
        }
    }
}

impl NegotiationConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `signaling_url` is not a WebSocket URL
    /// - a STUN or TURN URL has the wrong scheme
    /// - `metadata_label` is empty
    /// - `peer_id` is set but empty
    /// - the reconnection policy is inconsistent
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if !self.signaling_url.starts_with("ws://") && !self.signaling_url.starts_with("wss://") {
            return Err(Error::InvalidConfig(format!(
                "signaling_url must start with ws:// or wss://, got {}",
                self.signaling_url
            )));
        }

        for url in &self.stun_servers {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                return Err(Error::InvalidConfig(format!(
                    "STUN server URL must start with stun: or stuns:, got {}",
                    url
                )));
            }
        }

        for turn in &self.turn_servers {
            if !turn.url.starts_with("turn:") && !turn.url.starts_with("turns:") {
                return Err(Error::InvalidConfig(format!(
                    "TURN server URL must start with turn: or turns:, got {}",
                    turn.url
                )));
            }
        }

        if self.metadata_label.is_empty() {
            return Err(Error::InvalidConfig(
                "metadata_label must not be empty".to_string(),
            ));
        }

        if matches!(self.peer_id.as_deref(), Some("")) {
            return Err(Error::InvalidConfig("peer_id must not be empty".to_string()));
        }

        self.reconnect.validate()
    }

    /// Use a different relay URL
    pub fn with_signaling_url(mut self, url: impl Into<String>) -> Self {
        self.signaling_url = url.into();
        self
    }

    /// Use the given TURN servers
    pub fn with_turn_servers(mut self, turn_servers: Vec<TurnServerConfig>) -> Self {
        self.turn_servers = turn_servers;
        self
    }

    /// Use a fixed viewer identity
    pub fn with_peer_id(mut self, peer_id: impl Into<String>) -> Self {
        self.peer_id = Some(peer_id.into());
        self
    }

    /// Use a different session replacement policy
    pub fn with_reconnect(mut self, policy: ReconnectionPolicy) -> Self {
        self.reconnect = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = NegotiationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.metadata_label, "metadata");
        assert_eq!(config.signaling_url, "wss://localhost:3000");
    }

    #[test]
    fn test_invalid_signaling_url() {
        let config = NegotiationConfig::default().with_signaling_url("http://localhost:3000");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_turn_url() {
        let config = NegotiationConfig::default().with_turn_servers(vec![TurnServerConfig {
            url: "stun:turn.example.com".to_string(),
            username: "user".to_string(),
            credential: "pass".to_string(),
        }]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_metadata_label() {
        let config = NegotiationConfig {
            metadata_label: String::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_roundtrips_through_json() {
        let config = NegotiationConfig::default()
            .with_peer_id("v1")
            .with_reconnect(ReconnectionPolicy::unbounded());
        let json = serde_json::to_string(&config).unwrap();
        let parsed: NegotiationConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.peer_id.as_deref(), Some("v1"));
        assert_eq!(parsed.reconnect, ReconnectionPolicy::unbounded());
    }
}
