//! Peer connections and per-remote negotiation sessions

mod candidates;
mod link;
mod rtc;
mod session;

pub use candidates::CandidateBuffer;
pub use link::{
    ConnectivityState, DataLink, LinkEvent, LinkEvents, LinkFactory, PeerLink, SignalingState,
};
pub use rtc::{RtcLink, RtcLinkFactory};
pub use session::Session;
