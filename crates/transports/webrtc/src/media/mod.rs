//! Local and remote media model
//!
//! Local tracks are owned by the broadcaster engine and shared read-only by
//! every session they are attached to; toggling a track's enablement is seen
//! by all of them without renegotiation. Remote streams are what the viewer
//! engine hands to a rendering sink.

use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Media kind of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// One outgoing media track
///
/// Clones share the same enablement flag and RTP track.
#[derive(Clone)]
pub struct LocalTrack {
    kind: TrackKind,
    enabled: Arc<AtomicBool>,
    rtc_track: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    /// Create an Opus audio track
    pub fn audio(id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        Self::new(
            TrackKind::Audio,
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            id.into(),
            stream_id.into(),
        )
    }

    /// Create a VP8 video track
    pub fn video(id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        Self::new(
            TrackKind::Video,
            RTCRtpCodecCapability {
                mime_type: "video/VP8".to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            id.into(),
            stream_id.into(),
        )
    }

    fn new(kind: TrackKind, codec: RTCRtpCodecCapability, id: String, stream_id: String) -> Self {
        Self {
            kind,
            enabled: Arc::new(AtomicBool::new(true)),
            rtc_track: Arc::new(TrackLocalStaticSample::new(codec, id, stream_id)),
        }
    }

    pub fn id(&self) -> &str {
        self.rtc_track.id()
    }

    pub fn stream_id(&self) -> &str {
        self.rtc_track.stream_id()
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Flip enablement, returning the new state
    pub fn toggle(&self) -> bool {
        !self.enabled.fetch_xor(true, Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// RTP track handed to peer connections
    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.rtc_track)
    }

    /// Write one encoded sample; disabled tracks drop their samples
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        self.rtc_track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await
            .map_err(|e| Error::MediaTrackError(format!("Failed to write sample: {}", e)))
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id())
            .field("stream_id", &self.stream_id())
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// A captured source: camera+microphone or a screen
#[derive(Debug, Clone)]
pub struct LocalStream {
    id: String,
    tracks: Vec<LocalTrack>,
}

impl LocalStream {
    pub fn new(id: impl Into<String>, tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Video)
    }

    /// Swap the track with id `old_id`, returning whether it was found
    pub fn replace_track(&mut self, old_id: &str, track: LocalTrack) -> bool {
        match self.tracks.iter_mut().find(|t| t.id() == old_id) {
            Some(slot) => {
                *slot = track;
                true
            }
            None => false,
        }
    }
}

/// Local capture devices
#[async_trait]
pub trait MediaProvider: Send + Sync {
    /// Capture camera and microphone
    async fn capture_camera(&self) -> Result<LocalStream>;

    /// Capture the screen (video only)
    async fn capture_screen(&self) -> Result<LocalStream>;
}

/// One track received from the remote side
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
    /// RTP source for a rendering sink, when backed by a real connection
    pub rtp: Option<Arc<TrackRemote>>,
}

impl RemoteTrack {
    pub fn new(id: impl Into<String>, stream_id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            stream_id: stream_id.into(),
            kind,
            rtp: None,
        }
    }
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Heuristic label of a remote stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamLabel {
    /// Exactly one audio and one video track
    Camera,
    /// No audio track
    Screen,
}

/// Remote stream assembled from its tracks
#[derive(Debug, Clone)]
pub struct RemoteStream {
    id: String,
    tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[RemoteTrack] {
        &self.tracks
    }

    /// Add a track unless one with the same id is already present
    pub fn add_track(&mut self, track: RemoteTrack) -> bool {
        if self.tracks.iter().any(|t| t.id == track.id) {
            return false;
        }
        self.tracks.push(track);
        true
    }

    fn count(&self, kind: TrackKind) -> usize {
        self.tracks.iter().filter(|t| t.kind == kind).count()
    }

    pub fn label(&self) -> Option<StreamLabel> {
        let audio = self.count(TrackKind::Audio);
        let video = self.count(TrackKind::Video);
        if audio == 1 && video == 1 {
            Some(StreamLabel::Camera)
        } else if audio == 0 {
            Some(StreamLabel::Screen)
        } else {
            None
        }
    }
}
