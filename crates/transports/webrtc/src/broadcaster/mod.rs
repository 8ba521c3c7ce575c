//! Broadcaster negotiation engine
//!
//! The broadcaster owns the local media sources and a mesh of sessions, one
//! per joined viewer. A single engine task consumes signaling: `join` creates
//! a session, `answer` and `candidate` are routed to the session of their
//! `peer`. Local media changes are fanned out to every session, and the
//! metadata value is recomputed and pushed on each of them.
//!
//! ```no_run
//! use livecast_webrtc::{BroadcasterEngine, MediaProvider, NegotiationConfig};
//! use std::sync::Arc;
//!
//! # async fn example(devices: Arc<dyn MediaProvider>) -> livecast_webrtc::Result<()> {
//! let config = NegotiationConfig::default().with_signaling_url("wss://relay.example.com");
//! let broadcaster = BroadcasterEngine::connect(config, "demo", devices, None).await?;
//! broadcaster.start("demo").await?;
//! broadcaster.toggle_mute();
//! # Ok(())
//! # }
//! ```

mod mesh;

use crate::channels::metadata::{self, Metadata, StreamIds, STREAMS_KEY};
use crate::config::NegotiationConfig;
use crate::events::{EngineErrorCode, EngineEvent, EventSink};
use crate::media::{LocalStream, LocalTrack, MediaProvider, TrackKind};
use crate::peer::{LinkFactory, RtcLinkFactory};
use crate::{Error, Result};
use livecast_signaling::{
    streamer_identity, SignalMessage, SignalingTransport, WebSocketSignaling,
};
use mesh::{spawn_session, SessionCommand, SessionHandle};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Default)]
struct Sources {
    camera: Option<LocalStream>,
    screen: Option<LocalStream>,
}

pub(crate) struct BroadcasterShared {
    live: String,
    identity: String,
    config: NegotiationConfig,
    signaling: Arc<dyn SignalingTransport>,
    factory: Arc<dyn LinkFactory>,
    media: Arc<dyn MediaProvider>,
    sources: RwLock<Sources>,
    /// Application keys published alongside `streams`
    app_metadata: RwLock<Metadata>,
    metadata_tx: watch::Sender<Value>,
    mesh: RwLock<HashMap<String, SessionHandle>>,
    events: EventSink,
    next_session_id: AtomicU64,
}

impl BroadcasterShared {
    /// Every track of every captured source
    fn active_tracks(&self) -> Vec<LocalTrack> {
        let sources = self.sources.read();
        sources
            .camera
            .iter()
            .chain(sources.screen.iter())
            .flat_map(|stream| stream.tracks().iter().cloned())
            .collect()
    }

    fn stream_ids(&self) -> StreamIds {
        let sources = self.sources.read();
        StreamIds {
            camera: sources.camera.as_ref().map(|s| s.id().to_string()),
            screen: sources.screen.as_ref().map(|s| s.id().to_string()),
        }
    }

    /// Recompute the outbound metadata; sessions push it on change
    fn recompute_metadata(&self) -> Result<()> {
        let value = metadata::compose(&self.app_metadata.read(), &self.stream_ids())?;
        self.metadata_tx.send_if_modified(|current| {
            if *current == value {
                return false;
            }
            *current = value;
            true
        });
        Ok(())
    }

    fn fan_out(&self, make: impl Fn() -> SessionCommand) {
        for (viewer, handle) in self.mesh.read().iter() {
            if !handle.send(make()) {
                debug!(peer_id = %viewer, "Session already finished, command dropped");
            }
        }
    }

    fn handle_join(self: &Arc<Self>, stream: &str, viewer: Option<String>) {
        if stream != self.live {
            debug!(live = %stream, "Ignoring join for another live");
            return;
        }
        let Some(viewer) = viewer else {
            warn!(live = %stream, "Join without sender identity ignored");
            return;
        };

        let mut mesh = self.mesh.write();
        if mesh.contains_key(&viewer) {
            debug!(peer_id = %viewer, "Session already exists, join ignored");
            return;
        }
        let handle = spawn_session(self, &viewer);
        mesh.insert(viewer, handle);
    }

    fn route(&self, viewer: Option<String>, command: SessionCommand) {
        let Some(viewer) = viewer else {
            warn!("Negotiation message without sender identity ignored");
            return;
        };
        match self.mesh.read().get(&viewer) {
            Some(handle) => {
                if !handle.send(command) {
                    debug!(peer_id = %viewer, "Session finished, message dropped");
                }
            }
            None => debug!(peer_id = %viewer, "No session for sender, message dropped"),
        }
    }

    fn handle_signal(self: &Arc<Self>, message: SignalMessage) {
        match message {
            SignalMessage::Join { stream, peer, .. } => self.handle_join(&stream, peer),
            SignalMessage::Answer { sdp, peer, .. } => self.route(peer, SessionCommand::Answer(sdp)),
            SignalMessage::Candidate {
                candidate, peer, ..
            } => self.route(peer, SessionCommand::Candidate(candidate)),
            SignalMessage::Offer { peer, .. } => {
                warn!(from = ?peer, "Broadcaster does not accept offers");
            }
            SignalMessage::Start { .. } => {}
        }
    }
}

async fn run_engine(
    shared: Arc<BroadcasterShared>,
    mut inbound: broadcast::Receiver<SignalMessage>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            message = inbound.recv() => match message {
                Ok(message) => shared.handle_signal(message),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(peer_id = %shared.identity, "Signaling lagged, {} messages dropped", skipped);
                }
                Err(RecvError::Closed) => {
                    info!(peer_id = %shared.identity, "Signaling closed, broadcaster stopping");
                    break;
                }
            },
        }
    }

    let sessions: Vec<(String, SessionHandle)> = shared.mesh.write().drain().collect();
    for (viewer, handle) in sessions {
        handle.send(SessionCommand::Close);
        if let Err(e) = handle.task.await {
            warn!(peer_id = %viewer, "Session task ended abnormally: {}", e);
        }
        shared
            .events
            .emit(EngineEvent::session_removed(viewer, Some("engine closed".to_string())));
    }
    debug!(peer_id = %shared.identity, "Broadcaster task finished");
}

/// Broadcaster side of one live
pub struct BroadcasterEngine {
    shared: Arc<BroadcasterShared>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BroadcasterEngine {
    /// Connect to the relay as `streamer-<live>`
    pub async fn connect(
        config: NegotiationConfig,
        live: &str,
        media: Arc<dyn MediaProvider>,
        events: Option<mpsc::Sender<EngineEvent>>,
    ) -> Result<Self> {
        config.validate()?;
        let signaling =
            Arc::new(WebSocketSignaling::connect(&config.signaling_url, streamer_identity(live)).await?);
        let factory = Arc::new(RtcLinkFactory::new(config.clone()));
        Self::new(config, live, signaling, factory, media, events)
    }

    /// Build a broadcaster over an existing signaling transport and link factory
    ///
    /// Must be called within a tokio runtime.
    pub fn new(
        config: NegotiationConfig,
        live: &str,
        signaling: Arc<dyn SignalingTransport>,
        factory: Arc<dyn LinkFactory>,
        media: Arc<dyn MediaProvider>,
        events: Option<mpsc::Sender<EngineEvent>>,
    ) -> Result<Self> {
        config.validate()?;
        if live.is_empty() {
            return Err(Error::InvalidConfig("live id must not be empty".to_string()));
        }

        let initial = metadata::compose(&Metadata::new(), &StreamIds::default())?;
        let (metadata_tx, _) = watch::channel(initial);

        let shared = Arc::new(BroadcasterShared {
            live: live.to_string(),
            identity: signaling.identity().to_string(),
            config,
            signaling: Arc::clone(&signaling),
            factory,
            media,
            sources: RwLock::new(Sources::default()),
            app_metadata: RwLock::new(Metadata::new()),
            metadata_tx,
            mesh: RwLock::new(HashMap::new()),
            events: EventSink::new(events),
            next_session_id: AtomicU64::new(1),
        });

        let inbound = signaling.subscribe();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(run_engine(Arc::clone(&shared), inbound, shutdown_rx));

        info!(peer_id = %shared.identity, live = %shared.live, "Broadcaster engine started");
        Ok(Self {
            shared,
            shutdown: Mutex::new(Some(shutdown_tx)),
            task: Mutex::new(Some(handle)),
        })
    }

    pub fn identity(&self) -> &str {
        &self.shared.identity
    }

    pub fn live(&self) -> &str {
        &self.shared.live
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(Error::EngineStopped)
        }
    }

    /// Capture camera and microphone if needed, then announce the live
    pub async fn start(&self, stream: &str) -> Result<()> {
        self.ensure_running()?;
        if stream != self.shared.live {
            return Err(Error::InvalidConfig(format!(
                "broadcaster of '{}' cannot start '{}'",
                self.shared.live, stream
            )));
        }

        let has_camera = self.shared.sources.read().camera.is_some();
        if !has_camera {
            let camera = self.capture(self.shared.media.capture_camera()).await?;
            let tracks = camera.tracks().to_vec();
            self.shared.sources.write().camera = Some(camera);
            self.shared.fan_out(|| SessionCommand::AddTracks(tracks.clone()));
            self.shared.recompute_metadata()?;
        }

        self.shared.signaling.send(SignalMessage::start(stream)).await?;
        info!(peer_id = %self.shared.identity, live = %stream, "Live started");
        Ok(())
    }

    async fn capture(
        &self,
        capture: impl std::future::Future<Output = Result<LocalStream>>,
    ) -> Result<LocalStream> {
        capture.await.map_err(|e| {
            self.shared.events.emit(EngineEvent::error(
                EngineErrorCode::MediaError,
                e.to_string(),
                None,
            ));
            e
        })
    }

    fn toggle_camera_kind(&self, kind: TrackKind) -> Option<bool> {
        let sources = self.shared.sources.read();
        let camera = sources.camera.as_ref()?;
        let mut state = None;
        for track in camera.tracks().iter().filter(|t| t.kind() == kind) {
            state = Some(track.toggle());
        }
        state
    }

    /// Flip the microphone; returns the new enabled state
    ///
    /// No renegotiation happens; `None` when there is no microphone.
    pub fn toggle_mute(&self) -> Option<bool> {
        let state = self.toggle_camera_kind(TrackKind::Audio);
        debug!(peer_id = %self.shared.identity, enabled = ?state, "Microphone toggled");
        state
    }

    /// Flip the camera video; returns the new enabled state
    pub fn toggle_camera(&self) -> Option<bool> {
        let state = self.toggle_camera_kind(TrackKind::Video);
        debug!(peer_id = %self.shared.identity, enabled = ?state, "Camera toggled");
        state
    }

    /// Toggle the screen share, capturing it the first time
    ///
    /// A first capture attaches the screen track to every session, which
    /// renegotiates each of them once. Returns the new enabled state.
    pub async fn toggle_screen(&self) -> Result<bool> {
        self.ensure_running()?;
        {
            let sources = self.shared.sources.read();
            if let Some(screen) = sources.screen.as_ref() {
                let mut enabled = false;
                for track in screen.video_tracks() {
                    enabled = track.toggle();
                }
                debug!(peer_id = %self.shared.identity, enabled, "Screen toggled");
                return Ok(enabled);
            }
        }

        let screen = self.capture(self.shared.media.capture_screen()).await?;
        let tracks = screen.tracks().to_vec();
        {
            let mut sources = self.shared.sources.write();
            if sources.screen.is_some() {
                // Lost a race with a concurrent capture
                return Ok(true);
            }
            sources.screen = Some(screen);
        }
        info!(peer_id = %self.shared.identity, viewers = self.viewer_count(), "Screen share started");
        self.shared.fan_out(|| SessionCommand::AddTracks(tracks.clone()));
        self.shared.recompute_metadata()?;
        Ok(true)
    }

    /// Swap a local track on every session without renegotiation
    ///
    /// Returns false when no captured source holds `old_id`.
    pub fn replace_track(&self, old_id: &str, track: LocalTrack) -> Result<bool> {
        self.ensure_running()?;
        let replaced = {
            let mut sources = self.shared.sources.write();
            let Sources { camera, screen } = &mut *sources;
            camera
                .iter_mut()
                .chain(screen.iter_mut())
                .any(|stream| stream.replace_track(old_id, track.clone()))
        };
        if !replaced {
            return Ok(false);
        }

        self.shared.fan_out(|| SessionCommand::ReplaceTrack {
            old_id: old_id.to_string(),
            track: track.clone(),
        });
        self.shared.recompute_metadata()?;
        Ok(true)
    }

    /// Merge application keys into the outbound metadata
    ///
    /// The `streams` key is owned by the engine and cannot be overridden.
    pub fn publish_metadata(&self, update: Metadata) -> Result<()> {
        self.ensure_running()?;
        {
            let mut app = self.shared.app_metadata.write();
            for (key, value) in update {
                if key == STREAMS_KEY {
                    warn!("Ignoring reserved metadata key '{}'", STREAMS_KEY);
                    continue;
                }
                app.insert(key, value);
            }
        }
        self.shared.recompute_metadata()
    }

    /// Current outbound metadata
    pub fn metadata(&self) -> Value {
        self.shared.metadata_tx.borrow().clone()
    }

    /// Identities of the viewers with a live session, sorted
    pub fn viewers(&self) -> Vec<String> {
        let mut viewers: Vec<String> = self.shared.mesh.read().keys().cloned().collect();
        viewers.sort();
        viewers
    }

    pub fn viewer_count(&self) -> usize {
        self.shared.mesh.read().len()
    }

    pub fn has_session(&self, viewer: &str) -> bool {
        self.shared.mesh.read().contains_key(viewer)
    }

    pub fn camera(&self) -> Option<LocalStream> {
        self.shared.sources.read().camera.clone()
    }

    pub fn screen(&self) -> Option<LocalStream> {
        self.shared.sources.read().screen.clone()
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    /// Close every viewer session and the signaling transport
    pub async fn close(&self) -> Result<()> {
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(());
        }
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(peer_id = %self.shared.identity, "Broadcaster task ended abnormally: {}", e);
            }
        }
        self.shared.signaling.close().await?;
        info!(peer_id = %self.shared.identity, "Broadcaster engine closed");
        Ok(())
    }
}
