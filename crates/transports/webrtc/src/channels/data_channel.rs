//! webrtc-rs data channel bound to a link's event stream

use crate::peer::{DataLink, LinkEvent};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::RTCPeerConnection;

/// Data channel state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataChannelState {
    /// Channel is being created
    Connecting,
    /// Channel is open and ready for messages
    Open,
    /// Channel is closing
    Closing,
    /// Channel is closed
    Closed,
}

/// Ordered, reliable data channel of an `RtcLink`
///
/// Open and message callbacks are forwarded to the owning link's event
/// stream as `DataChannelOpen` and `DataChannelMessage`.
pub struct RtcDataLink {
    label: String,
    rtc_channel: Arc<RTCDataChannel>,
    state: Arc<RwLock<DataChannelState>>,
}

impl RtcDataLink {
    /// Create a locally opened channel on `peer_connection`
    pub async fn create(
        peer_connection: &RTCPeerConnection,
        label: &str,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<Self>> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };

        let rtc_channel = peer_connection
            .create_data_channel(label, Some(init))
            .await
            .map_err(|e| {
                Error::DataChannelError(format!("Failed to create data channel: {}", e))
            })?;

        Ok(Self::attach(rtc_channel, events))
    }

    /// Wrap a channel opened by the remote side
    pub fn attach(
        rtc_channel: Arc<RTCDataChannel>,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Arc<Self> {
        let initial = if rtc_channel.ready_state() == RTCDataChannelState::Open {
            DataChannelState::Open
        } else {
            DataChannelState::Connecting
        };

        let channel = Arc::new(Self {
            label: rtc_channel.label().to_string(),
            rtc_channel,
            state: Arc::new(RwLock::new(initial)),
        });
        channel.install_handlers(events);
        channel
    }

    fn install_handlers(&self, events: mpsc::UnboundedSender<LinkEvent>) {
        let state = Arc::clone(&self.state);
        let label = self.label.clone();
        let tx = events.clone();
        self.rtc_channel.on_open(Box::new(move || {
            Box::pin(async move {
                *state.write() = DataChannelState::Open;
                debug!("Data channel '{}' opened", label);
                let _ = tx.send(LinkEvent::DataChannelOpen(label));
            })
        }));

        let state = Arc::clone(&self.state);
        let label = self.label.clone();
        self.rtc_channel.on_close(Box::new(move || {
            let state = Arc::clone(&state);
            let label = label.clone();
            Box::pin(async move {
                *state.write() = DataChannelState::Closed;
                debug!("Data channel '{}' closed", label);
            })
        }));

        let label = self.label.clone();
        self.rtc_channel.on_error(Box::new(move |err| {
            let label = label.clone();
            Box::pin(async move {
                error!("Data channel '{}' error: {}", label, err);
            })
        }));

        let label = self.label.clone();
        self.rtc_channel.on_message(Box::new(move |msg| {
            let tx = events.clone();
            let label = label.clone();
            Box::pin(async move {
                if tx
                    .send(LinkEvent::DataChannelMessage {
                        label: label.clone(),
                        data: msg.data,
                    })
                    .is_err()
                {
                    warn!("Dropping message on data channel '{}': link released", label);
                }
            })
        }));
    }

    pub fn state(&self) -> DataChannelState {
        *self.state.read()
    }
}

#[async_trait]
impl DataLink for RtcDataLink {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        *self.state.read() == DataChannelState::Open
            || self.rtc_channel.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        if !self.is_open() {
            return Err(Error::DataChannelError(format!(
                "Data channel '{}' is not open",
                self.label
            )));
        }

        self.rtc_channel
            .send_text(text.to_string())
            .await
            .map_err(|e| Error::DataChannelError(format!("Failed to send: {}", e)))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        *self.state.write() = DataChannelState::Closing;

        self.rtc_channel
            .close()
            .await
            .map_err(|e| Error::DataChannelError(format!("Failed to close channel: {}", e)))?;

        *self.state.write() = DataChannelState::Closed;
        debug!("Data channel '{}' closed", self.label);
        Ok(())
    }
}
