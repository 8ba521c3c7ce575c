//! WebRTC negotiation engines for one-to-many live streaming
//!
//! One broadcaster streams audio, video and metadata to many viewers over
//! direct peer connections. Signaling (see `livecast-signaling`) only carries
//! the setup messages; this crate drives the negotiation on both ends.
//!
//! # Features
//!
//! - **Broadcaster engine**: a mesh of sessions, one per joined viewer, with
//!   renegotiation on local media changes and metadata fan-out
//! - **Viewer engine**: one session toward the broadcaster, stream labelling,
//!   metadata merge and session replacement on disconnect
//! - **Candidate buffering**: remote candidates wait for a stable signaling
//!   state and are applied in arrival order, exactly once
//! - **Peer capability interface**: engines drive [`PeerLink`], implemented
//!   over webrtc-rs by [`RtcLink`]
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────┐         ┌──────────────────────────┐
//! │ BroadcasterEngine            │         │ ViewerEngine             │
//! │ ├─ engine task (signaling)   │         │ └─ task                  │
//! │ ├─ local sources + metadata  │         │    └─ Session            │
//! │ └─ mesh                      │         │       └─ PeerLink        │
//! │    ├─ v1: task ─ Session     │ ◄─────► │                          │
//! │    └─ v2: task ─ Session     │  media  └──────────────────────────┘
//! │             └─ PeerLink      │
//! └──────────────────────────────┘
//!         ▲  SignalingTransport (relay or in-process hub)  ▲
//! ```
//!
//! # Example
//!
//! ```
//! use livecast_webrtc::{NegotiationConfig, ReconnectionPolicy};
//!
//! let config = NegotiationConfig::default()
//!     .with_signaling_url("ws://localhost:3000")
//!     .with_reconnect(ReconnectionPolicy::unbounded());
//! assert!(config.validate().is_ok());
//! assert_eq!(config.metadata_label, "metadata");
//! ```

#![warn(clippy::all)]

pub mod broadcaster;
pub mod channels;
pub mod config;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod media;
pub mod peer;
pub mod viewer;

pub use broadcaster::BroadcasterEngine;
pub use channels::{Metadata, RtcDataLink, StreamIds};
pub use config::{NegotiationConfig, TurnServerConfig, METADATA_CHANNEL_LABEL};
pub use error::{Error, Result};
pub use events::{EngineErrorCode, EngineEvent};
pub use lifecycle::{ReconnectionPolicy, MIN_RETRY_DELAY};
pub use media::{
    LocalStream, LocalTrack, MediaProvider, RemoteStream, RemoteTrack, StreamLabel, TrackKind,
};
pub use peer::{
    ConnectivityState, DataLink, LinkEvent, LinkEvents, LinkFactory, PeerLink, RtcLink,
    RtcLinkFactory, Session, SignalingState,
};
pub use viewer::ViewerEngine;

// Re-export the signaling surface engines are built on
pub use livecast_signaling::{
    streamer_identity, IceCandidate, LocalHub, LocalSignaling, SdpType, SessionDescription,
    SignalMessage, SignalingTransport, WebSocketSignaling,
};
