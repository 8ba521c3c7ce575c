//! End-to-end tests of the relay with real WebSocket clients

use futures_util::{SinkExt, StreamExt};
use livecast_signaling::{
    IceCandidate, RelayConfig, RelayHandle, RelayServer, RelayServerHandle, RelaySnapshot,
    SessionDescription, SignalMessage, SignalingTransport, WebSocketSignaling,
};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("livecast_signaling=debug")
        .with_test_writer()
        .try_init();
}

async fn start_relay() -> RelayServerHandle {
    init_tracing();
    let config = RelayConfig::default().with_bind_address("127.0.0.1:0");
    RelayServer::new(config).unwrap().start().await.unwrap()
}

/// Poll the relay until `condition` holds on its snapshot
async fn wait_for(relay: &RelayHandle, condition: impl Fn(&RelaySnapshot) -> bool) -> RelaySnapshot {
    for _ in 0..100 {
        let snapshot = relay.snapshot().await.unwrap();
        if condition(&snapshot) {
            return snapshot;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("relay never reached the expected state");
}

async fn next(rx: &mut broadcast::Receiver<SignalMessage>) -> Option<SignalMessage> {
    timeout(Duration::from_millis(300), rx.recv()).await.ok()?.ok()
}

async fn connect(handle: &RelayServerHandle, identity: &str) -> WebSocketSignaling {
    let transport = WebSocketSignaling::connect(&handle.url(), identity)
        .await
        .unwrap();
    let relay = handle.relay();
    let id = identity.to_string();
    wait_for(&relay, move |s| s.identities.contains(&id)).await;
    transport
}

#[tokio::test]
async fn test_start_then_join_reaches_broadcaster() {
    let handle = start_relay().await;
    let relay = handle.relay();

    let streamer = connect(&handle, "streamer-demo").await;
    let mut streamer_rx = streamer.subscribe();
    streamer.send(SignalMessage::start("demo")).await.unwrap();
    wait_for(&relay, |s| s.started.contains("demo")).await;

    let v1 = connect(&handle, "v1").await;
    v1.send(SignalMessage::join("demo")).await.unwrap();

    let received = next(&mut streamer_rx).await.unwrap();
    assert_eq!(received, SignalMessage::join("demo").with_peer("v1"));

    handle.shutdown().await;
}

#[tokio::test]
async fn test_directed_offer_and_answer_roundtrip() {
    let handle = start_relay().await;

    let streamer = connect(&handle, "streamer-demo").await;
    let viewer = connect(&handle, "v1").await;
    let mut streamer_rx = streamer.subscribe();
    let mut viewer_rx = viewer.subscribe();

    streamer
        .send(SignalMessage::offer(SessionDescription::offer("v=0 offer"), "v1"))
        .await
        .unwrap();
    let offer = next(&mut viewer_rx).await.unwrap();
    assert_eq!(offer.peer(), Some("streamer-demo"));
    assert_eq!(offer.kind(), "offer");

    viewer
        .send(SignalMessage::candidate(
            IceCandidate::new("candidate:1 1 udp 1 10.0.0.2 5000 typ host"),
            "streamer-demo",
        ))
        .await
        .unwrap();
    let candidate = next(&mut streamer_rx).await.unwrap();
    assert_eq!(candidate.peer(), Some("v1"));
    assert!(next(&mut viewer_rx).await.is_none());

    handle.shutdown().await;
}

#[tokio::test]
async fn test_unknown_destination_dropped_silently() {
    let handle = start_relay().await;

    let a = connect(&handle, "a").await;
    let mut a_rx = a.subscribe();
    a.send(SignalMessage::answer(SessionDescription::answer("v=0"), "nobody"))
        .await
        .unwrap();

    assert!(next(&mut a_rx).await.is_none());
    assert!(a.is_open());

    handle.shutdown().await;
}

#[tokio::test]
async fn test_connection_without_identity_rejected() {
    let handle = start_relay().await;

    let result = connect_async(handle.url()).await;
    assert!(result.is_err());

    let snapshot = handle.relay().snapshot().await.unwrap();
    assert_eq!(snapshot.connections, 0);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_malformed_frame_closes_only_offender() {
    let handle = start_relay().await;
    let relay = handle.relay();

    let a = connect(&handle, "a").await;
    let b = connect(&handle, "b").await;
    let mut b_rx = b.subscribe();

    let (mut bad, _) = connect_async(format!("{}/?peer=bad", handle.url()))
        .await
        .unwrap();
    wait_for(&relay, |s| s.identities.contains("bad")).await;
    bad.send(Message::Text("{not json".to_string())).await.unwrap();

    let closed = timeout(Duration::from_secs(1), async {
        while let Some(frame) = bad.next().await {
            if matches!(frame, Ok(Message::Close(_)) | Err(_)) {
                return true;
            }
        }
        true
    })
    .await
    .unwrap_or(false);
    assert!(closed);
    wait_for(&relay, |s| !s.identities.contains("bad")).await;

    a.send(SignalMessage::start("demo").directed("b")).await.unwrap();
    assert_eq!(next(&mut b_rx).await.unwrap().peer(), Some("a"));

    handle.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_cleans_registry() {
    let handle = start_relay().await;
    let relay = handle.relay();

    let streamer = connect(&handle, "streamer-demo").await;
    streamer.send(SignalMessage::start("demo")).await.unwrap();
    wait_for(&relay, |s| s.started.contains("demo")).await;

    let v1 = connect(&handle, "v1").await;
    v1.send(SignalMessage::join("demo")).await.unwrap();
    wait_for(&relay, |s| {
        s.viewers("demo").map_or(false, |viewers| viewers.contains("v1"))
    })
    .await;

    v1.close().await.unwrap();

    let snapshot = wait_for(&relay, |s| !s.identities.contains("v1")).await;
    assert!(!snapshot.viewers("demo").unwrap().contains("v1"));
    assert!(snapshot.started.contains("demo"));

    handle.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_clients() {
    let handle = start_relay().await;
    let client = connect(&handle, "v1").await;

    handle.shutdown().await;

    for _ in 0..100 {
        if !client.is_open() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("client still open after relay shutdown");
}
