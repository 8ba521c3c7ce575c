//! Relay-backed signaling transport over WebSocket

use super::{SignalingTransport, INBOUND_CAPACITY};
use crate::protocol::{SignalMessage, PEER_QUERY_PARAM};
use crate::{Error, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

/// Signaling transport connected to the relay server
///
/// The identity is bound at connect time through the `peer` query parameter
/// of the connection URL.
pub struct WebSocketSignaling {
    identity: String,
    outbound: mpsc::UnboundedSender<Message>,
    inbound: broadcast::Sender<SignalMessage>,
    open: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl WebSocketSignaling {
    /// Connect to `signaling_url` as `identity`
    ///
    /// Returns once the WebSocket handshake has completed.
    pub async fn connect(signaling_url: &str, identity: impl Into<String>) -> Result<Self> {
        let identity = identity.into();
        if identity.is_empty() {
            return Err(Error::MissingIdentity);
        }

        let url = connection_url(signaling_url, &identity)?;
        let (ws_stream, _response) = connect_async(url.as_str()).await?;
        info!(peer_id = %identity, "Connected to signaling relay at {}", signaling_url);

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (inbound, _) = broadcast::channel(INBOUND_CAPACITY);
        let open = Arc::new(AtomicBool::new(true));

        let open_writer = Arc::clone(&open);
        let writer = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let closing = msg.is_close();
                if let Err(e) = ws_tx.send(msg).await {
                    warn!("Failed to send signaling frame: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
            open_writer.store(false, Ordering::SeqCst);
        });

        let open_reader = Arc::clone(&open);
        let inbound_tx = inbound.clone();
        let reader_identity = identity.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_rx.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => {
                            warn!("Dropping non UTF-8 signaling frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(_)) => {
                        info!(peer_id = %reader_identity, "Signaling relay closed the connection");
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("Signaling connection error: {}", e);
                        break;
                    }
                };

                match SignalMessage::from_json(&text) {
                    Ok(message) => {
                        debug!(peer_id = %reader_identity, kind = message.kind(), "Signaling message received");
                        // No subscribers is not an error; the message is simply unobserved
                        let _ = inbound_tx.send(message);
                    }
                    Err(e) => warn!("Dropping malformed signaling message: {}", e),
                }
            }
            open_reader.store(false, Ordering::SeqCst);
        });

        Ok(Self {
            identity,
            outbound,
            inbound,
            open,
            reader,
            writer,
        })
    }
}

#[async_trait]
impl SignalingTransport for WebSocketSignaling {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn send(&self, message: SignalMessage) -> Result<()> {
        if !self.is_open() {
            return Err(Error::TransportClosed);
        }
        let text = message.to_json()?;
        self.outbound
            .send(Message::Text(text))
            .map_err(|_| Error::TransportClosed)
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalMessage> {
        self.inbound.subscribe()
    }

    async fn close(&self) -> Result<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            debug!(peer_id = %self.identity, "Closing signaling transport");
            let _ = self.outbound.send(Message::Close(None));
        }
        self.reader.abort();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.writer.is_finished()
    }
}

impl Drop for WebSocketSignaling {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Relay URL with the identity bound as query parameter
pub(crate) fn connection_url(signaling_url: &str, identity: &str) -> Result<Url> {
    let mut url = Url::parse(signaling_url)?;
    if url.scheme() != "ws" && url.scheme() != "wss" {
        return Err(Error::InvalidConfig(format!(
            "signaling URL must start with ws:// or wss://, got {}",
            signaling_url
        )));
    }
    url.query_pairs_mut().append_pair(PEER_QUERY_PARAM, identity);
    Ok(url)
}
