//! Negotiation state toward one remote participant
//!
//! A [`Session`] exclusively owns its link, candidate buffer, data channels
//! and attached track set. It is driven by exactly one task, which feeds it
//! signaling messages and link events in arrival order.

use super::candidates::CandidateBuffer;
use super::link::{ConnectivityState, DataLink, LinkEvent, PeerLink, SignalingState};
use crate::media::LocalTrack;
use crate::Result;
use livecast_signaling::{IceCandidate, SessionDescription, SignalMessage, SignalingTransport};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct Session {
    remote: String,
    link: Arc<dyn PeerLink>,
    signaling: Arc<dyn SignalingTransport>,
    candidates: CandidateBuffer,
    data_channels: HashMap<String, Arc<dyn DataLink>>,
    tracks: HashSet<String>,
    connectivity: ConnectivityState,
    negotiation_pending: bool,
}

impl Session {
    pub fn new(
        remote: impl Into<String>,
        link: Arc<dyn PeerLink>,
        signaling: Arc<dyn SignalingTransport>,
    ) -> Self {
        let remote = remote.into();
        debug!(peer_id = %remote, "Session created");
        Self {
            remote,
            link,
            signaling,
            candidates: CandidateBuffer::new(),
            data_channels: HashMap::new(),
            tracks: HashSet::new(),
            connectivity: ConnectivityState::New,
            negotiation_pending: false,
        }
    }

    /// Identity of the remote participant
    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn connectivity(&self) -> ConnectivityState {
        self.connectivity
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.link.signaling_state()
    }

    /// Number of remote candidates waiting for a stable link
    pub fn buffered_candidates(&self) -> usize {
        self.candidates.len()
    }

    pub fn data_channel(&self, label: &str) -> Option<&Arc<dyn DataLink>> {
        self.data_channels.get(label)
    }

    pub fn data_channel_labels(&self) -> impl Iterator<Item = &str> {
        self.data_channels.keys().map(String::as_str)
    }

    pub fn has_track(&self, track_id: &str) -> bool {
        self.tracks.contains(track_id)
    }

    /// Apply a remote candidate now, or buffer it until the link is stable
    ///
    /// A candidate is buffered while the link is not stable, and also while
    /// older candidates are still buffered, so arrival order is preserved.
    pub async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        if !self.candidates.is_empty() || self.link.signaling_state() != SignalingState::Stable {
            debug!(
                peer_id = %self.remote,
                buffered = self.candidates.len() + 1,
                "Buffering remote candidate"
            );
            self.candidates.push(candidate);
            return Ok(());
        }

        debug!(peer_id = %self.remote, "Applying remote candidate");
        self.link.add_ice_candidate(candidate).await
    }

    /// Apply buffered candidates in arrival order while the link is stable
    pub async fn drain_candidates(&mut self) {
        while self.link.signaling_state() == SignalingState::Stable {
            let Some(candidate) = self.candidates.pop() else {
                break;
            };
            if let Err(e) = self.link.add_ice_candidate(candidate).await {
                warn!(peer_id = %self.remote, "Failed to apply buffered candidate: {}", e);
            }
        }
    }

    /// Produce a fresh offer and send it to the remote
    ///
    /// Deferred until the link is stable again when an exchange is pending.
    pub async fn renegotiate(&mut self) -> Result<()> {
        if self.link.signaling_state() != SignalingState::Stable {
            debug!(peer_id = %self.remote, "Exchange pending, renegotiation deferred");
            self.negotiation_pending = true;
            return Ok(());
        }
        self.negotiation_pending = false;

        let offer = self.link.create_offer().await?;
        self.link.set_local_description(offer.clone()).await?;
        self.signaling
            .send(SignalMessage::offer(offer, self.remote.as_str()))
            .await?;
        debug!(peer_id = %self.remote, "Offer sent");
        Ok(())
    }

    /// Apply a remote offer and answer it
    pub async fn accept_offer(&mut self, offer: SessionDescription) -> Result<()> {
        self.link.set_remote_description(offer).await?;
        let answer = self.link.create_answer().await?;
        self.link.set_local_description(answer.clone()).await?;
        self.signaling
            .send(SignalMessage::answer(answer, self.remote.as_str()))
            .await?;
        debug!(peer_id = %self.remote, "Answer sent");
        self.on_stable().await
    }

    /// Apply a remote answer
    pub async fn accept_answer(&mut self, answer: SessionDescription) -> Result<()> {
        self.link.set_remote_description(answer).await?;
        self.on_stable().await
    }

    async fn on_stable(&mut self) -> Result<()> {
        if self.link.signaling_state() != SignalingState::Stable {
            return Ok(());
        }
        self.drain_candidates().await;
        if self.negotiation_pending {
            self.renegotiate().await?;
        }
        Ok(())
    }

    /// Attach a local track unless it is already attached
    pub async fn add_track(&mut self, track: &LocalTrack) -> Result<bool> {
        if self.tracks.contains(track.id()) {
            return Ok(false);
        }
        self.link.add_track(track).await?;
        self.tracks.insert(track.id().to_string());
        debug!(peer_id = %self.remote, track_id = %track.id(), "Track attached");
        Ok(true)
    }

    /// Swap an attached track without renegotiation
    pub async fn replace_track(&mut self, old_id: &str, track: &LocalTrack) -> Result<bool> {
        if !self.link.replace_track(old_id, track).await? {
            return Ok(false);
        }
        self.tracks.remove(old_id);
        self.tracks.insert(track.id().to_string());
        Ok(true)
    }

    pub async fn open_data_channel(&mut self, label: &str) -> Result<Arc<dyn DataLink>> {
        let channel = self.link.create_data_channel(label).await?;
        self.data_channels
            .insert(label.to_string(), Arc::clone(&channel));
        Ok(channel)
    }

    /// Process one link event
    ///
    /// Candidate discovery, signaling-state and negotiation events are fully
    /// handled here. Everything else is returned for the owning engine.
    pub async fn handle_link_event(&mut self, event: LinkEvent) -> Result<Option<LinkEvent>> {
        match event {
            LinkEvent::IceCandidate(candidate) => {
                self.signaling
                    .send(SignalMessage::candidate(candidate, self.remote.as_str()))
                    .await?;
                Ok(None)
            }
            LinkEvent::SignalingStateChange(state) => {
                debug!(peer_id = %self.remote, ?state, "Signaling state changed");
                self.on_stable().await?;
                Ok(None)
            }
            LinkEvent::NegotiationNeeded => {
                self.renegotiate().await?;
                Ok(None)
            }
            LinkEvent::ConnectionStateChange(state) => {
                if self.connectivity != state {
                    info!(peer_id = %self.remote, "Session state transition: {:?} -> {:?}", self.connectivity, state);
                    self.connectivity = state;
                }
                Ok(Some(LinkEvent::ConnectionStateChange(state)))
            }
            LinkEvent::DataChannel(channel) => {
                self.data_channels
                    .insert(channel.label().to_string(), Arc::clone(&channel));
                Ok(Some(LinkEvent::DataChannel(channel)))
            }
            other => Ok(Some(other)),
        }
    }

    /// Close channels and link; buffered candidates are discarded
    pub async fn close(&mut self) {
        self.candidates.clear();
        for (label, channel) in self.data_channels.drain() {
            if let Err(e) = channel.close().await {
                debug!(peer_id = %self.remote, "Failed to close data channel '{}': {}", label, e);
            }
        }
        if let Err(e) = self.link.close().await {
            debug!(peer_id = %self.remote, "Failed to close link: {}", e);
        }
        self.connectivity = ConnectivityState::Disconnected;
        info!(peer_id = %self.remote, "Session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use livecast_signaling::{LocalHub, LocalSignaling};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct ScriptedLink {
        state: Mutex<Option<SignalingState>>,
        applied: Mutex<Vec<String>>,
        offers: Mutex<u32>,
    }

    impl ScriptedLink {
        fn set_state(&self, state: SignalingState) {
            *self.state.lock() = Some(state);
        }
    }

    #[async_trait]
    impl PeerLink for ScriptedLink {
        async fn create_offer(&self) -> Result<SessionDescription> {
            *self.offers.lock() += 1;
            Ok(SessionDescription::offer("offer"))
        }
        async fn create_answer(&self) -> Result<SessionDescription> {
            Ok(SessionDescription::answer("answer"))
        }
        async fn set_local_description(&self, sdp: SessionDescription) -> Result<()> {
            let state = match sdp.sdp_type {
                livecast_signaling::SdpType::Offer => SignalingState::PendingExchange,
                _ => SignalingState::Stable,
            };
            self.set_state(state);
            Ok(())
        }
        async fn set_remote_description(&self, sdp: SessionDescription) -> Result<()> {
            let state = match sdp.sdp_type {
                livecast_signaling::SdpType::Offer => SignalingState::PendingExchange,
                _ => SignalingState::Stable,
            };
            self.set_state(state);
            Ok(())
        }
        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
            self.applied.lock().push(candidate.candidate);
            Ok(())
        }
        fn signaling_state(&self) -> SignalingState {
            (*self.state.lock()).unwrap_or(SignalingState::Stable)
        }
        async fn add_track(&self, _track: &LocalTrack) -> Result<()> {
            Ok(())
        }
        async fn replace_track(&self, _old_id: &str, _track: &LocalTrack) -> Result<bool> {
            Ok(true)
        }
        async fn create_data_channel(&self, _label: &str) -> Result<Arc<dyn DataLink>> {
            Err(crate::Error::DataChannelError("unsupported".to_string()))
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn new_session(link: Arc<ScriptedLink>) -> (Session, LocalSignaling) {
        let hub = LocalHub::new();
        let host = LocalSignaling::host(&hub, "demo");
        let viewer = LocalSignaling::client_with_identity(&hub, "demo", "v1");
        (Session::new("v1", link, Arc::new(host)), viewer)
    }

    #[tokio::test]
    async fn test_candidates_applied_immediately_when_stable() {
        let link = Arc::new(ScriptedLink::default());
        let (mut session, _viewer) = new_session(Arc::clone(&link));

        session.add_remote_candidate(IceCandidate::new("c1")).await.unwrap();

        assert_eq!(*link.applied.lock(), vec!["c1"]);
        assert_eq!(session.buffered_candidates(), 0);
    }

    #[tokio::test]
    async fn test_candidates_buffered_then_drained_in_order_once() {
        let link = Arc::new(ScriptedLink::default());
        let (mut session, _viewer) = new_session(Arc::clone(&link));
        session.renegotiate().await.unwrap();
        assert_eq!(session.signaling_state(), SignalingState::PendingExchange);

        for c in ["c1", "c2", "c3"] {
            session.add_remote_candidate(IceCandidate::new(c)).await.unwrap();
        }
        assert!(link.applied.lock().is_empty());
        assert_eq!(session.buffered_candidates(), 3);

        session
            .accept_answer(SessionDescription::answer("answer"))
            .await
            .unwrap();
        // A late state-change notification must not re-apply anything
        session
            .handle_link_event(LinkEvent::SignalingStateChange(SignalingState::Stable))
            .await
            .unwrap();

        assert_eq!(*link.applied.lock(), vec!["c1", "c2", "c3"]);
        assert_eq!(session.buffered_candidates(), 0);
    }

    #[tokio::test]
    async fn test_renegotiation_deferred_until_stable() {
        let link = Arc::new(ScriptedLink::default());
        let (mut session, _viewer) = new_session(Arc::clone(&link));

        session.renegotiate().await.unwrap();
        session
            .handle_link_event(LinkEvent::NegotiationNeeded)
            .await
            .unwrap();
        assert_eq!(*link.offers.lock(), 1);

        session
            .accept_answer(SessionDescription::answer("answer"))
            .await
            .unwrap();
        assert_eq!(*link.offers.lock(), 2);
    }

    #[tokio::test]
    async fn test_offer_sent_to_remote() {
        let link = Arc::new(ScriptedLink::default());
        let (mut session, viewer) = new_session(Arc::clone(&link));
        let mut inbox = viewer.subscribe();

        session.renegotiate().await.unwrap();

        let received = tokio::time::timeout(std::time::Duration::from_secs(1), inbox.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.kind(), "offer");
        assert_eq!(received.peer(), Some("streamer-demo"));
    }

    #[tokio::test]
    async fn test_close_discards_buffer() {
        let link = Arc::new(ScriptedLink::default());
        let (mut session, _viewer) = new_session(Arc::clone(&link));
        link.set_state(SignalingState::PendingExchange);
        session.add_remote_candidate(IceCandidate::new("c1")).await.unwrap();

        session.close().await;

        assert_eq!(session.buffered_candidates(), 0);
        assert_eq!(session.connectivity(), ConnectivityState::Disconnected);
    }
}
