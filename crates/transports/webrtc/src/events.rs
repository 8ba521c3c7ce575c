//! Engine event bridge
//!
//! Both engines optionally report what happens to their sessions over an
//! `mpsc` channel, so an application can react without polling.

use crate::media::StreamLabel;
use crate::Error;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

/// Events emitted by the broadcaster and viewer engines
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A session toward `peer_id` was created
    SessionCreated { peer_id: String },

    /// The session toward `peer_id` was removed
    SessionRemoved {
        peer_id: String,
        reason: Option<String>,
    },

    /// A remote stream appeared
    RemoteStreamAdded {
        stream_id: String,
        label: Option<StreamLabel>,
    },

    /// A known remote stream gained a track
    RemoteStreamUpdated {
        stream_id: String,
        label: Option<StreamLabel>,
    },

    /// Merged metadata after an update
    MetadataChanged { metadata: Value },

    /// A data channel toward `peer_id` opened
    DataChannelOpened { peer_id: String, label: String },

    /// The viewer is about to replace its session
    Reconnecting { attempt: u32, delay_ms: u64 },

    /// The viewer gave up replacing its session
    ReconnectAbandoned { attempts: u32 },

    /// Non-fatal failure
    Error {
        code: EngineErrorCode,
        message: String,
        peer_id: Option<String>,
    },
}

/// Error categories for [`EngineEvent::Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineErrorCode {
    /// Signaling transport failure
    SignalingError,
    /// Peer connection or negotiation failure
    PeerError,
    /// Local capture failure
    MediaError,
    /// Malformed metadata payload
    MetadataError,
}

impl From<&Error> for EngineErrorCode {
    fn from(error: &Error) -> Self {
        match error {
            Error::SignalingError(_) => Self::SignalingError,
            Error::MediaTrackError(_) => Self::MediaError,
            Error::SerializationError(_) => Self::MetadataError,
            _ => Self::PeerError,
        }
    }
}

impl EngineEvent {
    pub fn session_created(peer_id: impl Into<String>) -> Self {
        Self::SessionCreated {
            peer_id: peer_id.into(),
        }
    }

    pub fn session_removed(peer_id: impl Into<String>, reason: Option<String>) -> Self {
        Self::SessionRemoved {
            peer_id: peer_id.into(),
            reason,
        }
    }

    pub fn error(code: EngineErrorCode, message: impl Into<String>, peer_id: Option<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
            peer_id,
        }
    }

    /// Get the event name for logging/debugging
    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionCreated { .. } => "session_created",
            Self::SessionRemoved { .. } => "session_removed",
            Self::RemoteStreamAdded { .. } => "remote_stream_added",
            Self::RemoteStreamUpdated { .. } => "remote_stream_updated",
            Self::MetadataChanged { .. } => "metadata_changed",
            Self::DataChannelOpened { .. } => "data_channel_opened",
            Self::Reconnecting { .. } => "reconnecting",
            Self::ReconnectAbandoned { .. } => "reconnect_abandoned",
            Self::Error { .. } => "error",
        }
    }
}

/// Optional event channel shared by an engine's tasks
#[derive(Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<EngineEvent>>,
}

impl EventSink {
    pub fn new(tx: Option<mpsc::Sender<EngineEvent>>) -> Self {
        Self { tx }
    }

    /// Emit without waiting; events are dropped when the consumer lags
    pub fn emit(&self, event: EngineEvent) {
        if let Some(ref tx) = self.tx {
            if let Err(e) = tx.try_send(event) {
                warn!("Failed to emit engine event: {}", e);
            }
        }
    }
}
