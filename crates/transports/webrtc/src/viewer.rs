//! Viewer negotiation engine
//!
//! A viewer owns exactly one [`Session`], toward the broadcaster identity
//! `streamer-<live>`. One task drives it: it consumes the signaling
//! subscription and the session's link events in arrival order, and replaces
//! the session from scratch when its connectivity reports `Disconnected`.
//!
//! ```no_run
//! use livecast_webrtc::{NegotiationConfig, ViewerEngine};
//!
//! # async fn example() -> livecast_webrtc::Result<()> {
//! let config = NegotiationConfig::default().with_signaling_url("wss://relay.example.com");
//! let viewer = ViewerEngine::connect(config, "demo", None).await?;
//! viewer.join("demo").await?;
//! # Ok(())
//! # }
//! ```

use crate::channels::metadata::{self, Metadata, StreamIds};
use crate::config::NegotiationConfig;
use crate::events::{EngineErrorCode, EngineEvent, EventSink};
use crate::media::{RemoteStream, RemoteTrack, StreamLabel};
use crate::peer::{
    ConnectivityState, DataLink, LinkEvent, LinkEvents, LinkFactory, RtcLinkFactory, Session,
};
use crate::{Error, Result};
use livecast_signaling::{
    streamer_identity, SignalMessage, SignalingTransport, WebSocketSignaling,
};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Default)]
struct ViewerState {
    /// Remote streams in arrival order
    streams: Vec<RemoteStream>,
    metadata: Metadata,
    data_channels: Vec<String>,
    joined: Option<String>,
    connectivity: Option<ConnectivityState>,
    generation: u64,
}

struct ViewerShared {
    identity: String,
    live: String,
    broadcaster: String,
    config: NegotiationConfig,
    signaling: Arc<dyn SignalingTransport>,
    state: RwLock<ViewerState>,
    events: EventSink,
}

impl ViewerShared {
    /// Send a join; `joined` is recorded as soon as it is sent, not on reply
    async fn join(&self, stream: &str) -> Result<()> {
        self.signaling.send(SignalMessage::join(stream)).await?;
        self.state.write().joined = Some(stream.to_string());
        info!(peer_id = %self.identity, live = %stream, "Join sent");
        Ok(())
    }

    fn add_remote_track(&self, track: RemoteTrack) {
        let stream_id = track.stream_id.clone();
        let event = {
            let mut state = self.state.write();
            match state.streams.iter_mut().find(|s| s.id() == stream_id) {
                Some(stream) => {
                    if !stream.add_track(track) {
                        return;
                    }
                    EngineEvent::RemoteStreamUpdated {
                        stream_id,
                        label: stream.label(),
                    }
                }
                None => {
                    let mut stream = RemoteStream::new(stream_id.as_str());
                    stream.add_track(track);
                    let label = stream.label();
                    state.streams.push(stream);
                    EngineEvent::RemoteStreamAdded { stream_id, label }
                }
            }
        };
        debug!(peer_id = %self.identity, event = event.name(), "Remote track registered");
        self.events.emit(event);
    }

    fn record_channel(&self, label: &str) {
        let mut state = self.state.write();
        if !state.data_channels.iter().any(|l| l == label) {
            state.data_channels.push(label.to_string());
        }
    }

    fn ingest_metadata(&self, data: &[u8]) {
        let update = match metadata::parse_update(data) {
            Ok(update) => update,
            Err(e) => {
                warn!(peer_id = %self.identity, "Ignoring metadata update: {}", e);
                self.events.emit(EngineEvent::error(
                    EngineErrorCode::MetadataError,
                    e.to_string(),
                    Some(self.broadcaster.clone()),
                ));
                return;
            }
        };

        let merged = {
            let mut state = self.state.write();
            if !metadata::merge(&mut state.metadata, update) {
                return;
            }
            Value::Object(state.metadata.clone())
        };
        debug!(peer_id = %self.identity, "Metadata merged");
        self.events.emit(EngineEvent::MetadataChanged { metadata: merged });
    }

    /// Forget everything learned through the previous session; metadata stays
    fn reset_session_state(&self) {
        let mut state = self.state.write();
        state.streams.clear();
        state.data_channels.clear();
        state.connectivity = Some(ConnectivityState::Disconnected);
    }

    fn pick(&self, label: StreamLabel) -> Option<RemoteStream> {
        let state = self.state.read();
        let declared = StreamIds::from_metadata(&state.metadata).and_then(|ids| match label {
            StreamLabel::Camera => ids.camera,
            StreamLabel::Screen => ids.screen,
        });
        if let Some(id) = declared {
            if let Some(stream) = state.streams.iter().find(|s| s.id() == id) {
                return Some(stream.clone());
            }
        }
        state
            .streams
            .iter()
            .rev()
            .find(|s| s.label() == Some(label))
            .cloned()
    }
}

/// Task owning the viewer's session
struct ViewerTask {
    shared: Arc<ViewerShared>,
    factory: Arc<dyn LinkFactory>,
    session: Option<Session>,
    link_events: Option<LinkEvents>,
    shutdown: oneshot::Receiver<()>,
    stopped: bool,
    attempts: u32,
}

async fn next_link_event(events: Option<&mut LinkEvents>) -> Option<LinkEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl ViewerTask {
    async fn open_session(&mut self) -> Result<()> {
        let (link, events) = self.factory.create_link(&self.shared.broadcaster).await?;
        self.session = Some(Session::new(
            self.shared.broadcaster.as_str(),
            link,
            Arc::clone(&self.shared.signaling),
        ));
        self.link_events = Some(events);

        let generation = {
            let mut state = self.shared.state.write();
            state.generation += 1;
            state.connectivity = Some(ConnectivityState::New);
            state.generation
        };
        info!(peer_id = %self.shared.identity, generation, "Viewer session opened");
        self.shared
            .events
            .emit(EngineEvent::session_created(self.shared.broadcaster.as_str()));
        Ok(())
    }

    async fn run(mut self, mut inbound: broadcast::Receiver<SignalMessage>) {
        while !self.stopped {
            tokio::select! {
                _ = &mut self.shutdown => break,
                message = inbound.recv() => match message {
                    Ok(message) => self.handle_signal(message).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(peer_id = %self.shared.identity, "Signaling lagged, {} messages dropped", skipped);
                    }
                    Err(RecvError::Closed) => {
                        info!(peer_id = %self.shared.identity, "Signaling closed, viewer stopping");
                        break;
                    }
                },
                event = next_link_event(self.link_events.as_mut()) => match event {
                    Some(event) => self.handle_link_event(event).await,
                    None => self.replace_session("link released").await,
                },
            }
        }

        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
        debug!(peer_id = %self.shared.identity, "Viewer task finished");
    }

    fn from_broadcaster(&self, peer: Option<&str>) -> bool {
        match peer {
            Some(peer) if peer != self.shared.broadcaster => {
                debug!(peer_id = %self.shared.identity, from = %peer, "Ignoring negotiation from non-broadcaster");
                false
            }
            _ => true,
        }
    }

    fn report(&self, context: &str, error: Error) {
        warn!(peer_id = %self.shared.identity, "{} failed: {}", context, error);
        self.shared.events.emit(EngineEvent::error(
            EngineErrorCode::from(&error),
            format!("{}: {}", context, error),
            Some(self.shared.broadcaster.clone()),
        ));
    }

    async fn handle_signal(&mut self, message: SignalMessage) {
        let result = match message {
            SignalMessage::Start { stream, .. } => {
                if stream != self.shared.live {
                    debug!(peer_id = %self.shared.identity, live = %stream, "Ignoring start for another live");
                    return;
                }
                // A start is an implicit invitation to join
                self.shared.join(&stream).await
            }
            SignalMessage::Offer { sdp, peer, .. } => {
                if !self.from_broadcaster(peer.as_deref()) {
                    return;
                }
                match self.session.as_mut() {
                    Some(session) => session.accept_offer(sdp).await,
                    None => return,
                }
            }
            SignalMessage::Answer { sdp, peer, .. } => {
                if !self.from_broadcaster(peer.as_deref()) {
                    return;
                }
                match self.session.as_mut() {
                    Some(session) => session.accept_answer(sdp).await,
                    None => return,
                }
            }
            SignalMessage::Candidate { candidate, peer, .. } => {
                if !self.from_broadcaster(peer.as_deref()) {
                    return;
                }
                match self.session.as_mut() {
                    Some(session) => session.add_remote_candidate(candidate).await,
                    None => return,
                }
            }
            SignalMessage::Join { .. } => return,
        };

        if let Err(e) = result {
            self.report("Signal handling", e);
        }
    }

    async fn handle_link_event(&mut self, event: LinkEvent) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let event = match session.handle_link_event(event).await {
            Ok(Some(event)) => event,
            Ok(None) => return,
            Err(e) => {
                self.report("Link event", e);
                return;
            }
        };

        match event {
            LinkEvent::Track(track) => self.shared.add_remote_track(track),
            LinkEvent::DataChannel(channel) => {
                self.shared.record_channel(channel.label());
                if channel.is_open() {
                    self.channel_opened(channel.label());
                }
            }
            LinkEvent::DataChannelOpen(label) => {
                self.shared.record_channel(&label);
                self.channel_opened(&label);
            }
            LinkEvent::DataChannelMessage { label, data } => {
                if label == self.shared.config.metadata_label {
                    self.shared.ingest_metadata(&data);
                } else {
                    debug!(peer_id = %self.shared.identity, label = %label, "Message on application channel");
                }
            }
            LinkEvent::ConnectionStateChange(state) => {
                self.shared.state.write().connectivity = Some(state);
                match state {
                    ConnectivityState::Connected => self.attempts = 0,
                    ConnectivityState::Disconnected => self.replace_session("disconnected").await,
                    _ => {}
                }
            }
            _ => {}
        }
    }

    fn channel_opened(&self, label: &str) {
        self.shared.events.emit(EngineEvent::DataChannelOpened {
            peer_id: self.shared.broadcaster.clone(),
            label: label.to_string(),
        });
    }

    /// Discard the current session and build a fresh one per the policy
    async fn replace_session(&mut self, reason: &str) {
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
        self.link_events = None;
        self.shared.reset_session_state();
        self.shared.events.emit(EngineEvent::session_removed(
            self.shared.broadcaster.as_str(),
            Some(reason.to_string()),
        ));

        let policy = self.shared.config.reconnect.clone();
        loop {
            if !policy.should_retry(self.attempts) {
                warn!(
                    peer_id = %self.shared.identity,
                    attempts = self.attempts,
                    "Giving up on viewer session"
                );
                self.shared.events.emit(EngineEvent::ReconnectAbandoned {
                    attempts: self.attempts,
                });
                return;
            }

            let delay = policy.retry_delay(self.attempts);
            self.attempts = self.attempts.saturating_add(1);
            info!(
                peer_id = %self.shared.identity,
                attempt = self.attempts,
                delay_ms = delay.as_millis() as u64,
                "Replacing viewer session ({})",
                reason
            );
            self.shared.events.emit(EngineEvent::Reconnecting {
                attempt: self.attempts,
                delay_ms: delay.as_millis() as u64,
            });

            // Every attempt waits at least the policy floor and stays cancellable
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = &mut self.shutdown => {
                    self.stopped = true;
                    return;
                }
            }

            match self.open_session().await {
                Ok(()) => break,
                Err(e) if !e.is_retryable() => {
                    self.report("Session replacement", e);
                    self.shared.events.emit(EngineEvent::ReconnectAbandoned {
                        attempts: self.attempts,
                    });
                    return;
                }
                Err(e) => self.report("Session replacement", e),
            }
        }

        let joined = self.shared.state.read().joined.clone();
        if let Some(stream) = joined {
            if let Err(e) = self.shared.join(&stream).await {
                self.report("Re-join", e);
            }
        }
    }
}

/// Viewer side of one live
pub struct ViewerEngine {
    shared: Arc<ViewerShared>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ViewerEngine {
    /// Connect to the relay at `config.signaling_url` and watch `live`
    ///
    /// The identity is `config.peer_id`, or a fresh UUID v4.
    pub async fn connect(
        config: NegotiationConfig,
        live: &str,
        events: Option<mpsc::Sender<EngineEvent>>,
    ) -> Result<Self> {
        config.validate()?;
        let identity = config
            .peer_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let signaling = Arc::new(WebSocketSignaling::connect(&config.signaling_url, identity).await?);
        let factory = Arc::new(RtcLinkFactory::new(config.clone()));
        Self::new(config, live, signaling, factory, events).await
    }

    /// Build a viewer over an existing signaling transport and link factory
    pub async fn new(
        config: NegotiationConfig,
        live: &str,
        signaling: Arc<dyn SignalingTransport>,
        factory: Arc<dyn LinkFactory>,
        events: Option<mpsc::Sender<EngineEvent>>,
    ) -> Result<Self> {
        config.validate()?;
        if live.is_empty() {
            return Err(Error::InvalidConfig("live id must not be empty".to_string()));
        }

        let shared = Arc::new(ViewerShared {
            identity: signaling.identity().to_string(),
            live: live.to_string(),
            broadcaster: streamer_identity(live),
            config,
            signaling: Arc::clone(&signaling),
            state: RwLock::new(ViewerState::default()),
            events: EventSink::new(events),
        });

        let inbound = signaling.subscribe();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let mut task = ViewerTask {
            shared: Arc::clone(&shared),
            factory,
            session: None,
            link_events: None,
            shutdown: shutdown_rx,
            stopped: false,
            attempts: 0,
        };
        task.open_session().await?;

        info!(peer_id = %shared.identity, live = %shared.live, "Viewer engine started");
        let handle = tokio::spawn(task.run(inbound));

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

    /// Ask the broadcaster of `stream` for a session
    ///
    /// The live is remembered at once so a replaced session re-joins it;
    /// negotiation starts when the broadcaster's offer arrives.
    ///
    /// # Errors
    ///
    /// [`Error::EngineStopped`] once the engine is closed.
    pub async fn join(&self, stream: &str) -> Result<()> {
        if !self.is_running() {
            return Err(Error::EngineStopped);
        }
        self.shared.join(stream).await
    }

    /// Remote streams of the current session, in arrival order
    pub fn streams(&self) -> Vec<RemoteStream> {
        self.shared.state.read().streams.clone()
    }

    /// The broadcaster's camera stream
    ///
    /// Uses the ids the broadcaster declared in its metadata when present,
    /// otherwise the track-count heuristic.
    pub fn camera(&self) -> Option<RemoteStream> {
        self.shared.pick(StreamLabel::Camera)
    }

    pub fn screen(&self) -> Option<RemoteStream> {
        self.shared.pick(StreamLabel::Screen)
    }

    /// Metadata merged so far; survives session replacement
    pub fn metadata(&self) -> Metadata {
        self.shared.state.read().metadata.clone()
    }

    /// Labels of the data channels the broadcaster opened
    pub fn data_channels(&self) -> Vec<String> {
        self.shared.state.read().data_channels.clone()
    }

    pub fn connectivity(&self) -> ConnectivityState {
        self.shared
            .state
            .read()
            .connectivity
            .unwrap_or(ConnectivityState::New)
    }

    /// Number of sessions built so far, the first one included
    pub fn session_generation(&self) -> u64 {
        self.shared.state.read().generation
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    /// Stop the engine, close the session and the signaling transport
    pub async fn close(&self) -> Result<()> {
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(());
        }
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(peer_id = %self.shared.identity, "Viewer task ended abnormally: {}", e);
            }
        }
        self.shared.signaling.close().await?;
        info!(peer_id = %self.shared.identity, "Viewer engine closed");
        Ok(())
    }
}
