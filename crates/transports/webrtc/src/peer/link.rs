//! Peer capability interface
//!
//! The negotiation engines never touch `RTCPeerConnection` directly. They
//! drive a [`PeerLink`] and consume its [`LinkEvent`] stream, so the same
//! engines run over webrtc-rs in production and over scripted fakes in tests.

use crate::media::{LocalTrack, RemoteTrack};
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use livecast_signaling::{IceCandidate, SessionDescription};
use std::sync::Arc;
use tokio::sync::mpsc;

/// SDP exchange state of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    /// No description exchange pending
    Stable,
    /// An offer or provisional answer awaits its counterpart
    PendingExchange,
    /// Link closed
    Closed,
}

/// Connectivity of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    New,
    Connecting,
    Connected,
    /// Lost, failed or closed; the session owning the link must be replaced
    Disconnected,
}

/// Event raised by a link; each link has exactly one event stream
#[derive(Clone)]
pub enum LinkEvent {
    /// Locally discovered network candidate
    IceCandidate(IceCandidate),
    /// Remote track arrived
    Track(RemoteTrack),
    SignalingStateChange(SignalingState),
    ConnectionStateChange(ConnectivityState),
    /// Local description is stale after a track or channel change
    NegotiationNeeded,
    /// Remote side opened a data channel
    DataChannel(Arc<dyn DataLink>),
    /// A data channel finished opening
    DataChannelOpen(String),
    /// Message received on a data channel
    DataChannelMessage { label: String, data: Bytes },
}

impl std::fmt::Debug for LinkEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IceCandidate(c) => f.debug_tuple("IceCandidate").field(c).finish(),
            Self::Track(t) => f.debug_tuple("Track").field(t).finish(),
            Self::SignalingStateChange(s) => f.debug_tuple("SignalingStateChange").field(s).finish(),
            Self::ConnectionStateChange(s) => {
                f.debug_tuple("ConnectionStateChange").field(s).finish()
            }
            Self::NegotiationNeeded => f.write_str("NegotiationNeeded"),
            Self::DataChannel(dc) => f.debug_tuple("DataChannel").field(&dc.label()).finish(),
            Self::DataChannelOpen(label) => f.debug_tuple("DataChannelOpen").field(label).finish(),
            Self::DataChannelMessage { label, data } => f
                .debug_struct("DataChannelMessage")
                .field("label", label)
                .field("len", &data.len())
                .finish(),
        }
    }
}

/// Receiving half of a link's event stream
pub type LinkEvents = mpsc::UnboundedReceiver<LinkEvent>;

/// Negotiation capabilities of one peer connection
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, sdp: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, sdp: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    fn signaling_state(&self) -> SignalingState;

    /// Attach an outgoing track; raises `NegotiationNeeded`
    async fn add_track(&self, track: &LocalTrack) -> Result<()>;

    /// Swap the source of the sender carrying `old_id` without renegotiating
    ///
    /// Returns false when no sender carries that track.
    async fn replace_track(&self, old_id: &str, track: &LocalTrack) -> Result<bool>;

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataLink>>;

    async fn close(&self) -> Result<()>;
}

/// One data channel of a link
#[async_trait]
pub trait DataLink: Send + Sync {
    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    async fn send_text(&self, text: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Builds links toward remote participants
#[async_trait]
pub trait LinkFactory: Send + Sync {
    /// Create a fresh link toward `remote` with its event stream
    async fn create_link(&self, remote: &str) -> Result<(Arc<dyn PeerLink>, LinkEvents)>;
}
