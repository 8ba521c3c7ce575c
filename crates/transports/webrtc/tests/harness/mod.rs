//! Negotiation test harness
//!
//! Provides scripted stand-ins for everything below the engines:
//! - [`FakeLink`]: a peer link that records every call and models the
//!   signaling state the way a browser does (offer/answer exchanges)
//! - [`FakeLinkFactory`]: hands out fake links and keeps them for inspection
//! - [`FakeMediaProvider`]: deterministic camera and screen sources
//!
//! Engines talk to each other through an in-process `LocalHub`, so tests
//! need no relay and no network.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use livecast_webrtc::{
    DataLink, Error, IceCandidate, LinkEvent, LinkEvents, LinkFactory, LocalStream, LocalTrack,
    MediaProvider, PeerLink, Result, SdpType, SessionDescription, SignalMessage, SignalingState,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

pub const CAMERA_STREAM: &str = "camera-stream";
pub const SCREEN_STREAM: &str = "screen-stream";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("livecast_webrtc=debug,livecast_signaling=debug")
        .with_test_writer()
        .try_init();
}

/// Poll `condition` until it holds or two seconds elapse
pub async fn eventually<F>(condition: F) -> bool
where
    F: Fn() -> bool,
{
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Next signaling message within one second
pub async fn next_message(rx: &mut broadcast::Receiver<SignalMessage>) -> Option<SignalMessage> {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .ok()?
        .ok()
}

/// Next message of the given kind, skipping others (candidates, ...)
pub async fn next_of_kind(
    rx: &mut broadcast::Receiver<SignalMessage>,
    kind: &str,
) -> Option<SignalMessage> {
    loop {
        let message = next_message(rx).await?;
        if message.kind() == kind {
            return Some(message);
        }
    }
}

/// Await `future` with a one second bound
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(1), future)
        .await
        .expect("timed out")
}

/// Data channel recording what the engine sends on it
pub struct FakeDataLink {
    label: String,
    open: AtomicBool,
    sent: Mutex<Vec<String>>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl FakeDataLink {
    fn new(label: &str, events: mpsc::UnboundedSender<LinkEvent>) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            open: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            events,
        })
    }

    /// Finish opening; raises `DataChannelOpen` on the link
    pub fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
        let _ = self
            .events
            .send(LinkEvent::DataChannelOpen(self.label.clone()));
    }

    /// Simulate a message from the remote side
    pub fn deliver(&self, text: &str) {
        let _ = self.events.send(LinkEvent::DataChannelMessage {
            label: self.label.clone(),
            data: Bytes::from(text.to_string()),
        });
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    /// Sent payloads parsed as JSON
    pub fn sent_json(&self) -> Vec<serde_json::Value> {
        self.sent
            .lock()
            .iter()
            .filter_map(|text| serde_json::from_str(text).ok())
            .collect()
    }
}

#[async_trait]
impl DataLink for FakeDataLink {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        if !self.is_open() {
            return Err(Error::DataChannelError(format!(
                "Data channel '{}' is not open",
                self.label
            )));
        }
        self.sent.lock().push(text.to_string());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Scripted peer link
///
/// Signaling state follows the description exchange: a local or remote
/// offer makes the link `PendingExchange`, an answer makes it `Stable`.
/// `NegotiationNeeded` is raised when a track or the first data channel is
/// added, at most once until the next offer is created.
pub struct FakeLink {
    remote: String,
    events: mpsc::UnboundedSender<LinkEvent>,
    state: Mutex<SignalingState>,
    negotiation_needed: AtomicBool,
    offers: AtomicUsize,
    calls: Mutex<Vec<String>>,
    applied: Mutex<Vec<String>>,
    tracks: Mutex<Vec<String>>,
    channels: Mutex<HashMap<String, Arc<FakeDataLink>>>,
    closed: AtomicBool,
}

impl FakeLink {
    fn new(remote: &str) -> (Arc<Self>, LinkEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = Arc::new(Self {
            remote: remote.to_string(),
            events: tx,
            state: Mutex::new(SignalingState::Stable),
            negotiation_needed: AtomicBool::new(false),
            offers: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
            applied: Mutex::new(Vec::new()),
            tracks: Mutex::new(Vec::new()),
            channels: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        (link, rx)
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Inject a link event as if the platform raised it
    pub fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }

    /// Force a signaling state and announce it
    pub fn force_state(&self, state: SignalingState) {
        *self.state.lock() = state;
        self.emit(LinkEvent::SignalingStateChange(state));
    }

    /// Remote side opens a data channel toward this link
    pub fn open_remote_channel(&self, label: &str) -> Arc<FakeDataLink> {
        let channel = FakeDataLink::new(label, self.events.clone());
        self.emit(LinkEvent::DataChannel(Arc::clone(&channel) as Arc<dyn DataLink>));
        channel
    }

    pub fn offers(&self) -> usize {
        self.offers.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Candidates applied so far, in order
    pub fn applied(&self) -> Vec<String> {
        self.applied.lock().clone()
    }

    pub fn tracks(&self) -> Vec<String> {
        self.tracks.lock().clone()
    }

    pub fn channel(&self, label: &str) -> Option<Arc<FakeDataLink>> {
        self.channels.lock().get(label).cloned()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SignalingState {
        *self.state.lock()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }

    fn mark_negotiation_needed(&self) {
        if !self.negotiation_needed.swap(true, Ordering::SeqCst) {
            self.emit(LinkEvent::NegotiationNeeded);
        }
    }

    fn apply_description(&self, sdp: &SessionDescription) {
        let next = match sdp.sdp_type {
            SdpType::Offer | SdpType::Pranswer => SignalingState::PendingExchange,
            SdpType::Answer | SdpType::Rollback => SignalingState::Stable,
        };
        let changed = {
            let mut state = self.state.lock();
            let changed = *state != next;
            *state = next;
            changed
        };
        if changed {
            self.emit(LinkEvent::SignalingStateChange(next));
        }
    }
}

#[async_trait]
impl PeerLink for FakeLink {
    async fn create_offer(&self) -> Result<SessionDescription> {
        self.negotiation_needed.store(false, Ordering::SeqCst);
        let n = self.offers.fetch_add(1, Ordering::SeqCst) + 1;
        self.record("create_offer");
        Ok(SessionDescription::offer(format!("offer-{}", n)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.record("create_answer");
        Ok(SessionDescription::answer(format!("answer-to-{}", self.remote)))
    }

    async fn set_local_description(&self, sdp: SessionDescription) -> Result<()> {
        self.record(format!("set_local:{:?}", sdp.sdp_type));
        self.apply_description(&sdp);
        Ok(())
    }

    async fn set_remote_description(&self, sdp: SessionDescription) -> Result<()> {
        self.record(format!("set_remote:{:?}", sdp.sdp_type));
        self.apply_description(&sdp);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.applied.lock().push(candidate.candidate);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        *self.state.lock()
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        self.tracks.lock().push(track.id().to_string());
        self.mark_negotiation_needed();
        Ok(())
    }

    async fn replace_track(&self, old_id: &str, track: &LocalTrack) -> Result<bool> {
        let mut tracks = self.tracks.lock();
        match tracks.iter_mut().find(|id| id.as_str() == old_id) {
            Some(slot) => {
                *slot = track.id().to_string();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataLink>> {
        let channel = FakeDataLink::new(label, self.events.clone());
        let first = {
            let mut channels = self.channels.lock();
            let first = channels.is_empty();
            channels.insert(label.to_string(), Arc::clone(&channel));
            first
        };
        if first {
            self.mark_negotiation_needed();
        }
        Ok(channel as Arc<dyn DataLink>)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        *self.state.lock() = SignalingState::Closed;
        Ok(())
    }
}

/// Link factory keeping every link it built
#[derive(Default)]
pub struct FakeLinkFactory {
    links: Mutex<Vec<Arc<FakeLink>>>,
    failing: AtomicBool,
    failures: AtomicUsize,
}

impl FakeLinkFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn links_for(&self, remote: &str) -> Vec<Arc<FakeLink>> {
        self.links
            .lock()
            .iter()
            .filter(|link| link.remote() == remote)
            .cloned()
            .collect()
    }

    /// Most recent link toward `remote`
    pub fn latest(&self, remote: &str) -> Option<Arc<FakeLink>> {
        self.links_for(remote).pop()
    }

    pub fn count(&self) -> usize {
        self.links.lock().len()
    }

    /// Make every following `create_link` fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of `create_link` calls refused so far
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LinkFactory for FakeLinkFactory {
    async fn create_link(&self, remote: &str) -> Result<(Arc<dyn PeerLink>, LinkEvents)> {
        if self.failing.load(Ordering::SeqCst) {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(Error::PeerConnectionError(format!(
                "link toward {} refused",
                remote
            )));
        }
        let (link, events) = FakeLink::new(remote);
        self.links.lock().push(Arc::clone(&link));
        Ok((link as Arc<dyn PeerLink>, events))
    }
}

/// Camera is mic + cam in `camera-stream`; screen is one video track
#[derive(Default)]
pub struct FakeMediaProvider {
    camera_captures: AtomicUsize,
    screen_captures: AtomicUsize,
}

impl FakeMediaProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn camera_captures(&self) -> usize {
        self.camera_captures.load(Ordering::SeqCst)
    }

    pub fn screen_captures(&self) -> usize {
        self.screen_captures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaProvider for FakeMediaProvider {
    async fn capture_camera(&self) -> Result<LocalStream> {
        self.camera_captures.fetch_add(1, Ordering::SeqCst);
        Ok(LocalStream::new(
            CAMERA_STREAM,
            vec![
                LocalTrack::audio("mic", CAMERA_STREAM),
                LocalTrack::video("cam", CAMERA_STREAM),
            ],
        ))
    }

    async fn capture_screen(&self) -> Result<LocalStream> {
        self.screen_captures.fetch_add(1, Ordering::SeqCst);
        Ok(LocalStream::new(
            SCREEN_STREAM,
            vec![LocalTrack::video("screen", SCREEN_STREAM)],
        ))
    }
}
