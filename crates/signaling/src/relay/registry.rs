//! Routing state of the relay
//!
//! The registry is owned by exactly one relay session task and is never
//! shared, so it needs no locking. All mutation happens on connect, frame and
//! close events.

use crate::protocol::{streamer_identity, SignalMessage};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

/// Relay-assigned id of one WebSocket connection
pub type ConnectionId = u64;

/// Frame queued toward a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// JSON text frame
    Text(String),
    /// Close the connection
    Close(String),
}

struct Connection {
    identity: String,
    outbox: mpsc::Sender<Outbound>,
    current_live: Option<String>,
}

/// Point-in-time view of the registry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelaySnapshot {
    /// Identities with a registered transport
    pub identities: BTreeSet<String>,
    /// Viewer identities per live, keyed by live id
    pub lives: BTreeMap<String, BTreeSet<String>>,
    /// Lives whose broadcaster has sent `start`
    pub started: BTreeSet<String>,
    /// Open connections, registered or not
    pub connections: usize,
}

impl RelaySnapshot {
    /// Viewer identities currently joined to `live`
    pub fn viewers(&self, live: &str) -> Option<&BTreeSet<String>> {
        self.lives.get(live)
    }
}

/// Identity registry and live membership
#[derive(Default)]
pub(crate) struct Registry {
    peers: HashMap<String, ConnectionId>,
    connections: HashMap<ConnectionId, Connection>,
    lives: HashMap<String, HashSet<ConnectionId>>,
    started: HashSet<String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection under `identity`, replacing any earlier owner
    pub fn connect(
        &mut self,
        conn: ConnectionId,
        identity: String,
        outbox: mpsc::Sender<Outbound>,
    ) {
        if let Some(previous) = self.peers.insert(identity.clone(), conn) {
            if previous != conn {
                info!(peer_id = %identity, "Identity re-registered by a newer connection");
            }
        }
        info!(peer_id = %identity, conn, "Peer connected");
        self.connections.insert(
            conn,
            Connection {
                identity,
                outbox,
                current_live: None,
            },
        );
    }

    /// Handle one inbound text frame from `conn`
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` or `SerializationError` when the frame is
    /// not a well-formed message. The caller closes the connection.
    pub fn receive(&mut self, conn: ConnectionId, text: &str) -> Result<()> {
        let sender = match self.connections.get(&conn) {
            Some(connection) => connection.identity.clone(),
            None => {
                debug!(conn, "Frame from unregistered connection ignored");
                return Ok(());
            }
        };

        let mut value: Value = serde_json::from_str(text)?;
        let object = value
            .as_object_mut()
            .ok_or_else(|| Error::ProtocolViolation("frame is not a JSON object".to_string()))?;

        // Directed messages are relayed verbatim, whatever their type
        if let Some(to) = object.get("to").and_then(Value::as_str).map(str::to_string) {
            if to != sender {
                object.insert("peer".to_string(), Value::String(sender.clone()));
                self.route(&sender, &to, &value);
                return Ok(());
            }
        }

        match serde_json::from_value::<SignalMessage>(value)? {
            SignalMessage::Start { stream, .. } => self.start(conn, &sender, stream),
            SignalMessage::Join { stream, .. } => self.join(conn, &sender, stream),
            other => {
                debug!(peer_id = %sender, kind = other.kind(), "Undirected message ignored");
            }
        }
        Ok(())
    }

    /// Forget `conn` and every membership it held
    pub fn disconnect(&mut self, conn: ConnectionId) {
        let Some(connection) = self.connections.remove(&conn) else {
            return;
        };

        if let Some(live) = &connection.current_live {
            if let Some(viewers) = self.lives.get_mut(live) {
                viewers.remove(&conn);
            }
        }

        if self.peers.get(&connection.identity) == Some(&conn) {
            self.peers.remove(&connection.identity);
        }

        info!(peer_id = %connection.identity, conn, "Peer disconnected");
    }

    /// Ask every connection to close and forget all state
    pub fn close_all(&mut self, reason: &str) {
        for (conn, connection) in self.connections.drain() {
            debug!(peer_id = %connection.identity, conn, "Closing connection");
            let _ = connection.outbox.try_send(Outbound::Close(reason.to_string()));
        }
        self.peers.clear();
        self.lives.clear();
        self.started.clear();
    }

    /// Queue a close for `conn` and forget it
    pub fn evict(&mut self, conn: ConnectionId, reason: &str) {
        if let Some(connection) = self.connections.get(&conn) {
            warn!(peer_id = %connection.identity, conn, "Closing connection: {}", reason);
            let _ = connection.outbox.try_send(Outbound::Close(reason.to_string()));
        }
        self.disconnect(conn);
    }

    pub fn snapshot(&self) -> RelaySnapshot {
        let lives = self
            .lives
            .iter()
            .map(|(live, members)| {
                let viewers = members
                    .iter()
                    .filter_map(|conn| self.connections.get(conn))
                    .map(|connection| connection.identity.clone())
                    .collect();
                (live.clone(), viewers)
            })
            .collect();

        RelaySnapshot {
            identities: self.peers.keys().cloned().collect(),
            lives,
            started: self.started.iter().cloned().collect(),
            connections: self.connections.len(),
        }
    }

    fn route(&self, sender: &str, to: &str, value: &Value) {
        let Some(target) = self.peers.get(to) else {
            debug!(peer_id = %sender, to = %to, "Destination unknown, message dropped");
            return;
        };

        match serde_json::to_string(value) {
            Ok(text) => {
                debug!(peer_id = %sender, to = %to, "Relaying directed message");
                self.deliver(*target, text);
            }
            Err(e) => warn!("Failed to serialize relayed message: {}", e),
        }
    }

    fn start(&mut self, conn: ConnectionId, sender: &str, live: String) {
        info!(peer_id = %sender, live = %live, "Live started");

        let viewers: Vec<String> = self
            .lives
            .entry(live.clone())
            .or_default()
            .iter()
            .filter_map(|viewer| {
                let identity = &self.connections.get(viewer)?.identity;
                // Viewers displaced by a newer connection of their identity are skipped
                (self.peers.get(identity) == Some(viewer)).then(|| identity.clone())
            })
            .collect();
        self.started.insert(live.clone());

        for viewer in viewers {
            debug!(live = %live, viewer = %viewer, "Replaying join to broadcaster");
            self.send(conn, &SignalMessage::join(live.as_str()).with_peer(viewer));
        }
    }

    fn join(&mut self, conn: ConnectionId, sender: &str, live: String) {
        if !self.lives.contains_key(&live) {
            debug!(peer_id = %sender, live = %live, "Join for unknown live ignored");
            return;
        }

        let previous = self
            .connections
            .get_mut(&conn)
            .and_then(|connection| connection.current_live.replace(live.clone()));
        if let Some(previous) = previous.filter(|previous| *previous != live) {
            if let Some(viewers) = self.lives.get_mut(&previous) {
                viewers.remove(&conn);
            }
        }
        if let Some(viewers) = self.lives.get_mut(&live) {
            viewers.insert(conn);
        }
        info!(peer_id = %sender, live = %live, "Viewer joined");

        if self.started.contains(&live) {
            let broadcaster = streamer_identity(&live);
            match self.peers.get(&broadcaster) {
                Some(target) => {
                    let notice = SignalMessage::join(live.as_str()).with_peer(sender);
                    self.send(*target, &notice);
                }
                None => debug!(live = %live, "Broadcaster not connected, join not forwarded"),
            }
        }
    }

    fn send(&self, conn: ConnectionId, message: &SignalMessage) {
        match message.to_json() {
            Ok(text) => self.deliver(conn, text),
            Err(e) => warn!("Failed to serialize {} message: {}", message.kind(), e),
        }
    }

    fn deliver(&self, conn: ConnectionId, text: String) {
        let Some(connection) = self.connections.get(&conn) else {
            return;
        };
        match connection.outbox.try_send(Outbound::Text(text)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(peer_id = %connection.identity, "Outbound queue full, message dropped")
            }
            Err(TrySendError::Closed(_)) => {
                debug!(peer_id = %connection.identity, "Connection already closing, message dropped")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Peer {
        conn: ConnectionId,
        rx: mpsc::Receiver<Outbound>,
    }

    impl Peer {
        fn next(&mut self) -> Option<Value> {
            match self.rx.try_recv().ok()? {
                Outbound::Text(text) => serde_json::from_str(&text).ok(),
                Outbound::Close(_) => Some(json!({"closed": true})),
            }
        }
    }

    fn connect(registry: &mut Registry, conn: ConnectionId, identity: &str) -> Peer {
        let (tx, rx) = mpsc::channel(16);
        registry.connect(conn, identity.to_string(), tx);
        Peer { conn, rx }
    }

    #[test]
    fn test_scenario_start_then_join_notifies_broadcaster() {
        let mut registry = Registry::new();
        let mut streamer = connect(&mut registry, 1, "streamer-demo");
        registry
            .receive(streamer.conn, r#"{"type":"start","stream":"demo"}"#)
            .unwrap();
        let v1 = connect(&mut registry, 2, "v1");
        registry
            .receive(v1.conn, r#"{"type":"join","stream":"demo"}"#)
            .unwrap();

        assert_eq!(
            streamer.next(),
            Some(json!({"type": "join", "stream": "demo", "peer": "v1"}))
        );
        assert_eq!(streamer.next(), None);
    }

    #[test]
    fn test_second_viewer_also_reaches_broadcaster() {
        let mut registry = Registry::new();
        let mut streamer = connect(&mut registry, 1, "streamer-demo");
        registry
            .receive(1, r#"{"type":"start","stream":"demo"}"#)
            .unwrap();
        connect(&mut registry, 2, "v1");
        connect(&mut registry, 3, "v2");
        registry.receive(2, r#"{"type":"join","stream":"demo"}"#).unwrap();
        registry.receive(3, r#"{"type":"join","stream":"demo"}"#).unwrap();

        assert_eq!(streamer.next().unwrap()["peer"], "v1");
        assert_eq!(streamer.next().unwrap()["peer"], "v2");
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.viewers("demo").unwrap().len(), 2);
    }

    #[test]
    fn test_disconnect_removes_viewer_and_identity() {
        let mut registry = Registry::new();
        connect(&mut registry, 1, "streamer-demo");
        registry.receive(1, r#"{"type":"start","stream":"demo"}"#).unwrap();
        connect(&mut registry, 2, "v1");
        registry.receive(2, r#"{"type":"join","stream":"demo"}"#).unwrap();

        registry.disconnect(2);

        let snapshot = registry.snapshot();
        assert!(!snapshot.identities.contains("v1"));
        assert!(snapshot.viewers("demo").unwrap().is_empty());
        assert_eq!(snapshot.connections, 1);
    }

    #[test]
    fn test_directed_message_delivered_once_with_peer() {
        let mut registry = Registry::new();
        connect(&mut registry, 1, "a");
        let mut b = connect(&mut registry, 2, "b");

        registry
            .receive(1, r#"{"type":"offer","sdp":{"type":"offer","sdp":"v=0"},"to":"b"}"#)
            .unwrap();

        let delivered = b.next().unwrap();
        assert_eq!(delivered["peer"], "a");
        assert_eq!(delivered["to"], "b");
        assert_eq!(delivered["sdp"]["sdp"], "v=0");
        assert_eq!(b.next(), None);
    }

    #[test]
    fn test_directed_routing_precedes_type_handling() {
        let mut registry = Registry::new();
        let mut a = connect(&mut registry, 1, "a");
        let mut b = connect(&mut registry, 2, "b");

        registry
            .receive(1, r#"{"type":"start","stream":"demo","to":"b"}"#)
            .unwrap();

        assert_eq!(b.next().unwrap()["type"], "start");
        assert!(registry.snapshot().started.is_empty());
        assert_eq!(a.next(), None);
    }

    #[test]
    fn test_directed_message_to_unknown_identity_dropped() {
        let mut registry = Registry::new();
        let mut a = connect(&mut registry, 1, "a");
        let before = registry.snapshot();

        let result = registry.receive(
            1,
            r#"{"type":"candidate","candidate":{"candidate":""},"to":"ghost"}"#,
        );

        assert!(result.is_ok());
        assert_eq!(a.next(), None);
        assert_eq!(registry.snapshot(), before);
    }

    #[test]
    fn test_join_before_start_is_noop() {
        let mut registry = Registry::new();
        let mut streamer = connect(&mut registry, 1, "streamer-demo");
        connect(&mut registry, 2, "v1");
        let before = registry.snapshot();

        registry.receive(2, r#"{"type":"join","stream":"demo"}"#).unwrap();

        assert_eq!(registry.snapshot(), before);
        assert_eq!(streamer.next(), None);
    }

    #[test]
    fn test_restart_replays_joined_viewers() {
        let mut registry = Registry::new();
        connect(&mut registry, 1, "streamer-demo");
        registry.receive(1, r#"{"type":"start","stream":"demo"}"#).unwrap();
        connect(&mut registry, 2, "v1");
        registry.receive(2, r#"{"type":"join","stream":"demo"}"#).unwrap();
        registry.disconnect(1);

        let mut streamer = connect(&mut registry, 3, "streamer-demo");
        registry.receive(3, r#"{"type":"start","stream":"demo"}"#).unwrap();

        assert_eq!(
            streamer.next(),
            Some(json!({"type": "join", "stream": "demo", "peer": "v1"}))
        );
        assert!(registry.snapshot().started.contains("demo"));
    }

    #[test]
    fn test_stale_close_keeps_newer_identity() {
        let mut registry = Registry::new();
        connect(&mut registry, 1, "v1");
        let mut newer = connect(&mut registry, 2, "v1");
        connect(&mut registry, 3, "a");

        registry.disconnect(1);
        registry
            .receive(3, r#"{"type":"answer","sdp":{"type":"answer","sdp":"v=0"},"to":"v1"}"#)
            .unwrap();

        assert!(registry.snapshot().identities.contains("v1"));
        assert_eq!(newer.next().unwrap()["peer"], "a");
    }

    #[test]
    fn test_malformed_frame_is_protocol_error() {
        let mut registry = Registry::new();
        connect(&mut registry, 1, "a");

        let err = registry.receive(1, "{not json").unwrap_err();
        assert!(err.is_protocol_error());
        let err = registry.receive(1, "[1,2,3]").unwrap_err();
        assert!(err.is_protocol_error());
        let err = registry.receive(1, r#"{"type":"bogus"}"#).unwrap_err();
        assert!(err.is_protocol_error());
    }

    #[test]
    fn test_evict_closes_and_forgets() {
        let mut registry = Registry::new();
        let mut a = connect(&mut registry, 1, "a");

        registry.evict(1, "protocol violation");

        assert_eq!(a.next(), Some(json!({"closed": true})));
        assert!(registry.snapshot().identities.is_empty());
    }

    #[test]
    fn test_registry_never_retains_closed_identities() {
        let mut registry = Registry::new();
        let ops: &[(ConnectionId, &str, Option<&str>)] = &[
            (1, "streamer-x", Some(r#"{"type":"start","stream":"x"}"#)),
            (2, "v1", Some(r#"{"type":"join","stream":"x"}"#)),
            (3, "v2", Some(r#"{"type":"join","stream":"y"}"#)),
            (4, "v1", Some(r#"{"type":"join","stream":"x"}"#)),
            (5, "streamer-y", Some(r#"{"type":"start","stream":"y"}"#)),
        ];
        let mut peers = Vec::new();
        for (conn, identity, frame) in ops {
            peers.push(connect(&mut registry, *conn, identity));
            if let Some(frame) = frame {
                registry.receive(*conn, frame).unwrap();
            }
        }

        for conn in [2, 4, 1, 3, 5] {
            registry.disconnect(conn);
        }

        let snapshot = registry.snapshot();
        assert!(snapshot.identities.is_empty());
        assert!(snapshot.lives.values().all(|viewers| viewers.is_empty()));
        assert_eq!(snapshot.connections, 0);
        assert!(snapshot.started.contains("x"));
    }
}
