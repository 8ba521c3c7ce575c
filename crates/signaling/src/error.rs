//! Error types for signaling transports and the relay

/// Result type alias using the signaling Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while exchanging signaling messages
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Connection attempted without a participant identity
    #[error("Missing participant identity")]
    MissingIdentity,

    /// Inbound frame violated the wire protocol
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Transport was closed locally or by the remote end
    #[error("Signaling transport closed")]
    TransportClosed,

    /// Relay session has shut down
    #[error("Relay session stopped")]
    RelayStopped,

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocketError(#[from] tokio_tungstenite::tungstenite::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Signaling URL could not be parsed
    #[error("Invalid signaling URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::TransportClosed | Error::WebSocketError(_) | Error::IoError(_)
        )
    }

    /// Check if this error was caused by the remote side breaking the protocol
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Error::ProtocolViolation(_) | Error::SerializationError(_)
        )
    }
}
