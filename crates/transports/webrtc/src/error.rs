//! Error types for the negotiation engines

/// Result type alias using the negotiation Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while negotiating peer sessions
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Signaling transport error
    #[error("Signaling error: {0}")]
    SignalingError(#[from] livecast_signaling::Error),

    /// WebRTC peer connection error
    #[error("Peer connection error: {0}")]
    PeerConnectionError(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// Data channel error
    #[error("Data channel error: {0}")]
    DataChannelError(String),

    /// Media track error
    #[error("Media track error: {0}")]
    MediaTrackError(String),

    /// Engine was closed or its signaling ended
    #[error("Negotiation engine stopped")]
    EngineStopped,

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::SignalingError(e) => e.is_retryable(),
            Error::PeerConnectionError(_) => true,
            _ => false,
        }
    }
}
