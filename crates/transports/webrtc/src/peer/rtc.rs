//! webrtc-rs implementation of [`PeerLink`]

use super::link::{
    ConnectivityState, DataLink, LinkEvent, LinkEvents, LinkFactory, PeerLink, SignalingState,
};
use crate::channels::RtcDataLink;
use crate::config::NegotiationConfig;
use crate::media::{LocalTrack, RemoteTrack, TrackKind};
use crate::{Error, Result};
use async_trait::async_trait;
use livecast_signaling::{IceCandidate, SdpType, SessionDescription};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Builds [`RtcLink`]s with the configured STUN/TURN servers
pub struct RtcLinkFactory {
    config: NegotiationConfig,
}

impl RtcLinkFactory {
    pub fn new(config: NegotiationConfig) -> Self {
        Self { config }
    }

    fn ice_servers(&self) -> Vec<RTCIceServer> {
        self.config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .chain(self.config.turn_servers.iter().map(|turn| {
                #[allow(clippy::needless_update)]
                RTCIceServer {
                    urls: vec![turn.url.clone()],
                    username: turn.username.clone(),
                    credential: turn.credential.clone(),
                    ..Default::default()
                }
            }))
            .collect()
    }
}

#[async_trait]
impl LinkFactory for RtcLinkFactory {
    async fn create_link(&self, remote: &str) -> Result<(Arc<dyn PeerLink>, LinkEvents)> {
        let (link, events) = RtcLink::new(remote, self.ice_servers()).await?;
        Ok((link as Arc<dyn PeerLink>, events))
    }
}

/// One `RTCPeerConnection` toward a remote participant
pub struct RtcLink {
    remote: String,
    peer_connection: Arc<RTCPeerConnection>,
    /// Senders by the id of the local track they carry
    senders: Mutex<HashMap<String, Arc<RTCRtpSender>>>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl RtcLink {
    /// Create a peer connection and wire its callbacks into a fresh event stream
    #[instrument(skip_all, fields(remote = %remote))]
    pub async fn new(remote: &str, ice_servers: Vec<RTCIceServer>) -> Result<(Arc<Self>, LinkEvents)> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
                Error::WebRtcError(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let peer_connection =
            Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
                Error::PeerConnectionError(format!("Failed to create peer connection: {}", e))
            })?);

        let (tx, rx) = mpsc::unbounded_channel();
        let link = Arc::new(Self {
            remote: remote.to_string(),
            peer_connection,
            senders: Mutex::new(HashMap::new()),
            events: tx,
        });
        link.install_handlers();

        info!("Created peer connection toward {}", remote);
        Ok((link, rx))
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    fn install_handlers(&self) {
        let pc = &self.peer_connection;

        let tx = self.events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                // None marks the end of local gathering
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(LinkEvent::IceCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => warn!("Failed to serialize local candidate: {}", e),
                }
            })
        }));

        let tx = self.events.clone();
        pc.on_signaling_state_change(Box::new(move |s: RTCSignalingState| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(LinkEvent::SignalingStateChange(signaling_state(s)));
            })
        }));

        let tx = self.events.clone();
        let remote = self.remote.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let tx = tx.clone();
            let remote = remote.clone();
            Box::pin(async move {
                let state = match s {
                    RTCPeerConnectionState::New => ConnectivityState::New,
                    RTCPeerConnectionState::Connecting => ConnectivityState::Connecting,
                    RTCPeerConnectionState::Connected => ConnectivityState::Connected,
                    RTCPeerConnectionState::Disconnected
                    | RTCPeerConnectionState::Failed
                    | RTCPeerConnectionState::Closed => ConnectivityState::Disconnected,
                    RTCPeerConnectionState::Unspecified => return,
                };
                debug!("Peer connection toward {} is {:?}", remote, s);
                let _ = tx.send(LinkEvent::ConnectionStateChange(state));
            })
        }));

        let tx = self.events.clone();
        pc.on_negotiation_needed(Box::new(move || {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(LinkEvent::NegotiationNeeded);
            })
        }));

        let tx = self.events.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let tx = tx.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => TrackKind::Audio,
                        RTPCodecType::Video => TrackKind::Video,
                        RTPCodecType::Unspecified => {
                            warn!("Ignoring remote track {} of unknown kind", track.id());
                            return;
                        }
                    };
                    let mut remote_track = RemoteTrack::new(track.id(), track.stream_id(), kind);
                    remote_track.rtp = Some(track);
                    let _ = tx.send(LinkEvent::Track(remote_track));
                })
            },
        ));

        let tx = self.events.clone();
        pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let tx = tx.clone();
            Box::pin(async move {
                let link = RtcDataLink::attach(channel, tx.clone());
                let _ = tx.send(LinkEvent::DataChannel(link as Arc<dyn DataLink>));
            })
        }));
    }
}

fn signaling_state(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::Stable | RTCSignalingState::Unspecified => SignalingState::Stable,
        RTCSignalingState::Closed => SignalingState::Closed,
        _ => SignalingState::PendingExchange,
    }
}

fn to_rtc(sdp: SessionDescription) -> Result<RTCSessionDescription> {
    let converted = match sdp.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(sdp.sdp),
        SdpType::Answer => RTCSessionDescription::answer(sdp.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(sdp.sdp),
        SdpType::Rollback => {
            return Err(Error::SdpError("rollback descriptions are not supported".to_string()))
        }
    };
    converted.map_err(|e| Error::SdpError(format!("Invalid session description: {}", e)))
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription> {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => {
            return Err(Error::SdpError("unspecified description type".to_string()))
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: desc.sdp,
    })
}

#[async_trait]
impl PeerLink for RtcLink {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create offer: {}", e)))?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create answer: {}", e)))?;
        from_rtc(answer)
    }

    async fn set_local_description(&self, sdp: SessionDescription) -> Result<()> {
        self.peer_connection
            .set_local_description(to_rtc(sdp)?)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(&self, sdp: SessionDescription) -> Result<()> {
        self.peer_connection
            .set_remote_description(to_rtc(sdp)?)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::IceCandidateError(format!("Failed to add candidate: {}", e)))
    }

    fn signaling_state(&self) -> SignalingState {
        signaling_state(self.peer_connection.signaling_state())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        let sender = self
            .peer_connection
            .add_track(track.rtc_track() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| Error::MediaTrackError(format!("Failed to add track: {}", e)))?;

        // Drain RTCP so the interceptors keep running
        let rtcp_sender = Arc::clone(&sender);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut buf).await.is_ok() {}
        });

        self.senders.lock().insert(track.id().to_string(), sender);
        debug!("Attached track {} toward {}", track.id(), self.remote);
        Ok(())
    }

    async fn replace_track(&self, old_id: &str, track: &LocalTrack) -> Result<bool> {
        let sender = self.senders.lock().get(old_id).cloned();
        let Some(sender) = sender else {
            return Ok(false);
        };

        sender
            .replace_track(Some(track.rtc_track() as Arc<dyn TrackLocal + Send + Sync>))
            .await
            .map_err(|e| Error::MediaTrackError(format!("Failed to replace track: {}", e)))?;

        let mut senders = self.senders.lock();
        senders.remove(old_id);
        senders.insert(track.id().to_string(), sender);
        Ok(true)
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataLink>> {
        let channel = RtcDataLink::create(&self.peer_connection, label, self.events.clone()).await?;
        Ok(channel as Arc<dyn DataLink>)
    }

    async fn close(&self) -> Result<()> {
        self.senders.lock().clear();
        self.peer_connection
            .close()
            .await
            .map_err(|e| Error::PeerConnectionError(format!("Failed to close: {}", e)))
    }
}
