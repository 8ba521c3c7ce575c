//! Per-viewer session tasks
//!
//! Every joined viewer gets one task owning its [`Session`]. The engine talks
//! to it only through [`SessionCommand`]s, so a stalled negotiation with one
//! viewer never blocks the others.

use super::BroadcasterShared;
use crate::events::{EngineErrorCode, EngineEvent};
use crate::media::LocalTrack;
use crate::peer::{ConnectivityState, DataLink, LinkEvent, LinkEvents, Session};
use crate::Result;
use livecast_signaling::{IceCandidate, SessionDescription};
use serde_json::Value;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Instruction from the engine to one viewer session
#[derive(Debug)]
pub(crate) enum SessionCommand {
    Answer(SessionDescription),
    Candidate(IceCandidate),
    /// Attach tracks of a newly captured source
    AddTracks(Vec<LocalTrack>),
    ReplaceTrack { old_id: String, track: LocalTrack },
    Close,
}

/// Engine-side handle of a viewer session task
pub(crate) struct SessionHandle {
    pub(crate) id: u64,
    pub(crate) commands: mpsc::UnboundedSender<SessionCommand>,
    pub(crate) task: JoinHandle<()>,
}

impl SessionHandle {
    pub(crate) fn send(&self, command: SessionCommand) -> bool {
        self.commands.send(command).is_ok()
    }
}

/// Spawn the session task toward `viewer`
pub(crate) fn spawn_session(shared: &Arc<BroadcasterShared>, viewer: &str) -> SessionHandle {
    let id = shared.next_session_id.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = mpsc::unbounded_channel();
    let metadata = shared.metadata_tx.subscribe();
    let task = tokio::spawn(run_session(
        Arc::clone(shared),
        viewer.to_string(),
        id,
        rx,
        metadata,
    ));
    SessionHandle {
        id,
        commands: tx,
        task,
    }
}

async fn run_session(
    shared: Arc<BroadcasterShared>,
    viewer: String,
    id: u64,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    metadata: watch::Receiver<Value>,
) {
    let reason = match ViewerSession::open(&shared, &viewer).await {
        Ok((worker, events)) => worker.run(commands, events, metadata).await,
        Err(e) => {
            warn!(peer_id = %viewer, "Failed to set up session: {}", e);
            shared.events.emit(EngineEvent::error(
                EngineErrorCode::from(&e),
                format!("session setup failed: {}", e),
                Some(viewer.clone()),
            ));
            format!("setup failed: {}", e)
        }
    };

    // A newer session for the same viewer may already have replaced this one
    let removed = {
        let mut mesh = shared.mesh.write();
        if mesh.get(&viewer).map(|h| h.id) == Some(id) {
            mesh.remove(&viewer);
            true
        } else {
            false
        }
    };
    if removed {
        info!(peer_id = %viewer, reason = %reason, "Viewer session removed");
        shared
            .events
            .emit(EngineEvent::session_removed(viewer, Some(reason)));
    }
}

struct ViewerSession {
    shared: Arc<BroadcasterShared>,
    session: Session,
    metadata_channel: Arc<dyn DataLink>,
    /// Latest metadata still owed to the viewer
    metadata_pending: bool,
}

impl ViewerSession {
    async fn open(shared: &Arc<BroadcasterShared>, viewer: &str) -> Result<(Self, LinkEvents)> {
        let (link, events) = shared.factory.create_link(viewer).await?;
        let mut session = Session::new(viewer, link, Arc::clone(&shared.signaling));

        let metadata_channel = session
            .open_data_channel(&shared.config.metadata_label)
            .await?;
        for track in shared.active_tracks() {
            session.add_track(&track).await?;
        }

        info!(peer_id = %viewer, live = %shared.live, "Viewer session created");
        shared.events.emit(EngineEvent::session_created(viewer));

        Ok((
            Self {
                shared: Arc::clone(shared),
                session,
                metadata_channel,
                metadata_pending: true,
            },
            events,
        ))
    }

    fn viewer(&self) -> &str {
        self.session.remote()
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        mut events: LinkEvents,
        mut metadata: watch::Receiver<Value>,
    ) -> String {
        let reason = loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SessionCommand::Close) | None => break "closed".to_string(),
                    Some(command) => self.handle_command(command).await,
                },
                event = events.recv() => match event {
                    Some(event) => {
                        if self.handle_link_event(event, &metadata).await {
                            break "disconnected".to_string();
                        }
                    }
                    None => break "link released".to_string(),
                },
                changed = metadata.changed() => match changed {
                    Ok(()) => {
                        let value = metadata.borrow_and_update().clone();
                        self.push_metadata(value).await;
                    }
                    Err(_) => break "engine stopped".to_string(),
                },
            }
        };

        // Buffered candidates are discarded with the session
        self.session.close().await;
        reason
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        let result = match command {
            SessionCommand::Answer(sdp) => self.session.accept_answer(sdp).await,
            SessionCommand::Candidate(candidate) => {
                self.session.add_remote_candidate(candidate).await
            }
            SessionCommand::AddTracks(tracks) => {
                let mut result = Ok(());
                for track in &tracks {
                    if let Err(e) = self.session.add_track(track).await {
                        result = Err(e);
                        break;
                    }
                }
                result
            }
            SessionCommand::ReplaceTrack { old_id, track } => self
                .session
                .replace_track(&old_id, &track)
                .await
                .map(|replaced| {
                    if !replaced {
                        debug!(peer_id = %self.viewer(), track_id = %old_id, "Track not attached, nothing replaced");
                    }
                }),
            SessionCommand::Close => Ok(()),
        };

        if let Err(e) = result {
            warn!(peer_id = %self.viewer(), "Session command failed: {}", e);
            self.shared.events.emit(EngineEvent::error(
                EngineErrorCode::from(&e),
                e.to_string(),
                Some(self.viewer().to_string()),
            ));
        }
    }

    /// Returns true once the session is disconnected
    async fn handle_link_event(&mut self, event: LinkEvent, metadata: &watch::Receiver<Value>) -> bool {
        let event = match self.session.handle_link_event(event).await {
            Ok(Some(event)) => event,
            Ok(None) => return false,
            Err(e) => {
                warn!(peer_id = %self.viewer(), "Link event failed: {}", e);
                return false;
            }
        };

        match event {
            LinkEvent::ConnectionStateChange(ConnectivityState::Disconnected) => return true,
            LinkEvent::DataChannelOpen(label) => {
                self.shared.events.emit(EngineEvent::DataChannelOpened {
                    peer_id: self.viewer().to_string(),
                    label: label.clone(),
                });
                if label == self.metadata_channel.label() && self.metadata_pending {
                    let value = metadata.borrow().clone();
                    self.push_metadata(value).await;
                }
            }
            LinkEvent::DataChannelMessage { label, .. } => {
                debug!(peer_id = %self.viewer(), label = %label, "Ignoring inbound data channel message");
            }
            _ => {}
        }
        false
    }

    /// Send metadata now, or once the channel first opens
    async fn push_metadata(&mut self, value: Value) {
        if !self.metadata_channel.is_open() {
            self.metadata_pending = true;
            debug!(peer_id = %self.viewer(), "Metadata channel not open, push deferred");
            return;
        }
        self.metadata_pending = false;

        match self.metadata_channel.send_text(&value.to_string()).await {
            Ok(()) => debug!(peer_id = %self.viewer(), "Metadata pushed"),
            Err(e) => warn!(peer_id = %self.viewer(), "Failed to push metadata: {}", e),
        }
    }
}
