//! Same-process signaling transport
//!
//! Participants of one live share a broadcast channel on a [`LocalHub`]. The
//! host side (the broadcaster) sees every client's traffic; clients only see
//! traffic from the host. Messages are annotated with the sender identity as
//! `peer`, like the relay does, so engines cannot tell the two transports
//! apart.

use super::{SignalingTransport, INBOUND_CAPACITY};
use crate::protocol::{streamer_identity, SignalMessage};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// One post on a live channel
#[derive(Debug, Clone)]
struct Envelope {
    message: SignalMessage,
    origin: String,
    from_client: bool,
}

/// Registry of per-live broadcast channels
#[derive(Clone, Default)]
pub struct LocalHub {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<Envelope>>>>,
}

impl LocalHub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self::default()
    }

    fn channel(&self, live: &str) -> broadcast::Sender<Envelope> {
        let mut channels = self.channels.lock();
        channels
            .entry(live.to_string())
            .or_insert_with(|| broadcast::channel(INBOUND_CAPACITY).0)
            .clone()
    }

    /// Number of lives with an open channel
    pub fn live_count(&self) -> usize {
        self.channels.lock().len()
    }
}

/// Signaling transport over a [`LocalHub`] channel
pub struct LocalSignaling {
    identity: String,
    live: String,
    is_client: bool,
    channel: broadcast::Sender<Envelope>,
    inbound: broadcast::Sender<SignalMessage>,
    open: AtomicBool,
    pump: JoinHandle<()>,
}

impl LocalSignaling {
    /// Host side of `live`, bound to the reserved broadcaster identity
    pub fn host(hub: &LocalHub, live: &str) -> Self {
        Self::attach(hub, live, streamer_identity(live), false)
    }

    /// Client side of `live` with a generated identity
    pub fn client(hub: &LocalHub, live: &str) -> Self {
        Self::client_with_identity(hub, live, uuid::Uuid::new_v4().to_string())
    }

    /// Client side of `live` with a chosen identity
    pub fn client_with_identity(hub: &LocalHub, live: &str, identity: impl Into<String>) -> Self {
        Self::attach(hub, live, identity.into(), true)
    }

    fn attach(hub: &LocalHub, live: &str, identity: String, is_client: bool) -> Self {
        let channel = hub.channel(live);
        let (inbound, _) = broadcast::channel(INBOUND_CAPACITY);

        let mut posts = channel.subscribe();
        let inbound_tx = inbound.clone();
        let me = identity.clone();
        let pump = tokio::spawn(async move {
            loop {
                let envelope = match posts.recv().await {
                    Ok(envelope) => envelope,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(peer_id = %me, "Local signaling lagged, {} messages dropped", skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };

                if envelope.origin == me || (is_client && envelope.from_client) {
                    continue;
                }
                if let Some(to) = envelope.message.to() {
                    if to != me {
                        continue;
                    }
                }

                let _ = inbound_tx.send(envelope.message.with_peer(envelope.origin));
            }
        });

        debug!(peer_id = %identity, live = %live, is_client, "Attached to local signaling hub");

        Self {
            identity,
            live: live.to_string(),
            is_client,
            channel,
            inbound,
            open: AtomicBool::new(true),
            pump,
        }
    }

    /// Live this transport is attached to
    pub fn live(&self) -> &str {
        &self.live
    }

    /// Whether this is a client (viewer) endpoint
    pub fn is_client(&self) -> bool {
        self.is_client
    }
}

#[async_trait]
impl SignalingTransport for LocalSignaling {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn send(&self, message: SignalMessage) -> Result<()> {
        if !self.is_open() {
            return Err(Error::TransportClosed);
        }
        // Nobody listening is the same as an unknown destination: dropped silently
        let _ = self.channel.send(Envelope {
            message,
            origin: self.identity.clone(),
            from_client: self.is_client,
        });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalMessage> {
        self.inbound.subscribe()
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        self.pump.abort();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl Drop for LocalSignaling {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next(rx: &mut broadcast::Receiver<SignalMessage>) -> Option<SignalMessage> {
        timeout(Duration::from_millis(200), rx.recv()).await.ok()?.ok()
    }

    #[tokio::test]
    async fn test_host_sees_client_join_with_peer() {
        let hub = LocalHub::new();
        let host = LocalSignaling::host(&hub, "demo");
        let client = LocalSignaling::client_with_identity(&hub, "demo", "v1");
        let mut host_rx = host.subscribe();

        client.send(SignalMessage::join("demo")).await.unwrap();

        let received = next(&mut host_rx).await.unwrap();
        assert_eq!(received, SignalMessage::join("demo").with_peer("v1"));
    }

    #[tokio::test]
    async fn test_clients_do_not_hear_each_other() {
        let hub = LocalHub::new();
        let _host = LocalSignaling::host(&hub, "demo");
        let v1 = LocalSignaling::client_with_identity(&hub, "demo", "v1");
        let v2 = LocalSignaling::client_with_identity(&hub, "demo", "v2");
        let mut v2_rx = v2.subscribe();

        v1.send(SignalMessage::join("demo")).await.unwrap();

        assert!(next(&mut v2_rx).await.is_none());
    }

    #[tokio::test]
    async fn test_directed_message_reaches_only_destination() {
        let hub = LocalHub::new();
        let host = LocalSignaling::host(&hub, "demo");
        let v1 = LocalSignaling::client_with_identity(&hub, "demo", "v1");
        let v2 = LocalSignaling::client_with_identity(&hub, "demo", "v2");
        let mut v1_rx = v1.subscribe();
        let mut v2_rx = v2.subscribe();

        host.send(SignalMessage::start("demo").directed("v2"))
            .await
            .unwrap();

        assert!(next(&mut v1_rx).await.is_none());
        let received = next(&mut v2_rx).await.unwrap();
        assert_eq!(received.peer(), Some("streamer-demo"));
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let hub = LocalHub::new();
        let client = LocalSignaling::client(&hub, "demo");
        client.close().await.unwrap();
        assert!(matches!(
            client.send(SignalMessage::join("demo")).await,
            Err(Error::TransportClosed)
        ));
        assert_eq!(hub.live_count(), 1);
    }
}
