//! Wire protocol for the live signaling exchange
//!
//! Every frame is one JSON object tagged by `type`:
//!
//! ```text
//! {"type":"offer",     "sdp":{...},       "to":"v1"}
//! {"type":"answer",    "sdp":{...},       "to":"streamer-demo", "peer":"v1"}
//! {"type":"candidate", "candidate":{...}, "to":"streamer-demo", "peer":"v1"}
//! {"type":"join",      "stream":"demo",   "peer":"v1"}
//! {"type":"start",     "stream":"demo"}
//! ```
//!
//! `to` is the routing envelope: the relay forwards any message whose `to`
//! differs from the sender verbatim, with `peer` set to the sender identity.
//! Senders never fill in `peer` themselves.

use serde::{Deserialize, Serialize};

/// Prefix of the reserved broadcaster identity of a live
pub const STREAMER_PREFIX: &str = "streamer-";

/// Query parameter carrying the participant identity at connect time
pub const PEER_QUERY_PARAM: &str = "peer";

/// Reserved identity of the broadcaster of `live`
pub fn streamer_identity(live: &str) -> String {
    format!("{}{}", STREAMER_PREFIX, live)
}

/// Live id owning a reserved broadcaster identity, if `identity` is one
pub fn live_of_streamer(identity: &str) -> Option<&str> {
    identity.strip_prefix(STREAMER_PREFIX)
}

/// SDP type of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Proposal from the initiating side
    Offer,
    /// Provisional answer
    Pranswer,
    /// Final answer
    Answer,
    /// Rollback of a pending local description
    Rollback,
}

/// Session description as browsers serialize `RTCSessionDescriptionInit`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub sdp_type: SdpType,

    /// Raw SDP text
    pub sdp: String,
}

impl SessionDescription {
    /// Wrap an SDP offer
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Wrap an SDP answer
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate as browsers serialize `RTCIceCandidateInit`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Candidate attribute line; empty marks end of candidates
    pub candidate: String,

    /// Media stream identification tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,

    /// Index of the media description the candidate belongs to
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,

    /// ICE username fragment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Candidate with only the attribute line set
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// One signaling message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalMessage {
    /// SDP offer toward `to`
    Offer {
        sdp: SessionDescription,
        to: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer: Option<String>,
    },

    /// SDP answer toward `to`
    Answer {
        sdp: SessionDescription,
        to: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer: Option<String>,
    },

    /// Network candidate toward `to`
    Candidate {
        candidate: IceCandidate,
        to: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer: Option<String>,
    },

    /// Viewer asks to join a live
    Join {
        stream: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer: Option<String>,
    },

    /// Broadcaster (re)starts a live
    Start {
        stream: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer: Option<String>,
    },
}

impl SignalMessage {
    /// Offer addressed to `to`
    pub fn offer(sdp: SessionDescription, to: impl Into<String>) -> Self {
        Self::Offer {
            sdp,
            to: to.into(),
            peer: None,
        }
    }

    /// Answer addressed to `to`
    pub fn answer(sdp: SessionDescription, to: impl Into<String>) -> Self {
        Self::Answer {
            sdp,
            to: to.into(),
            peer: None,
        }
    }

    /// Candidate addressed to `to`
    pub fn candidate(candidate: IceCandidate, to: impl Into<String>) -> Self {
        Self::Candidate {
            candidate,
            to: to.into(),
            peer: None,
        }
    }

    /// Join request for `stream`
    pub fn join(stream: impl Into<String>) -> Self {
        Self::Join {
            stream: stream.into(),
            to: None,
            peer: None,
        }
    }

    /// Start notice for `stream`
    pub fn start(stream: impl Into<String>) -> Self {
        Self::Start {
            stream: stream.into(),
            to: None,
            peer: None,
        }
    }

    /// Wire tag of this message
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Candidate { .. } => "candidate",
            Self::Join { .. } => "join",
            Self::Start { .. } => "start",
        }
    }

    /// Destination identity, if directed
    pub fn to(&self) -> Option<&str> {
        match self {
            Self::Offer { to, .. } | Self::Answer { to, .. } | Self::Candidate { to, .. } => {
                Some(to)
            }
            Self::Join { to, .. } | Self::Start { to, .. } => to.as_deref(),
        }
    }

    /// Sender identity attached on delivery
    pub fn peer(&self) -> Option<&str> {
        match self {
            Self::Offer { peer, .. }
            | Self::Answer { peer, .. }
            | Self::Candidate { peer, .. }
            | Self::Join { peer, .. }
            | Self::Start { peer, .. } => peer.as_deref(),
        }
    }

    /// Same message annotated with the sender identity
    pub fn with_peer(mut self, sender: impl Into<String>) -> Self {
        let sender = Some(sender.into());
        match &mut self {
            Self::Offer { peer, .. }
            | Self::Answer { peer, .. }
            | Self::Candidate { peer, .. }
            | Self::Join { peer, .. }
            | Self::Start { peer, .. } => *peer = sender,
        }
        self
    }

    /// Same message directed at `destination`
    pub fn directed(mut self, destination: impl Into<String>) -> Self {
        let destination = destination.into();
        match &mut self {
            Self::Offer { to, .. } | Self::Answer { to, .. } | Self::Candidate { to, .. } => {
                *to = destination
            }
            Self::Join { to, .. } | Self::Start { to, .. } => *to = Some(destination),
        }
        self
    }

    /// Serialize to one JSON frame
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse one JSON frame
    pub fn from_json(text: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
