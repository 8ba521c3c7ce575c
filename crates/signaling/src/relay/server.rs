//! WebSocket relay server
//!
//! Accepts connections, hands each one to the connection handler and owns the
//! relay session for as long as the listener runs.

use super::handler::handle_connection;
use super::session::{RelayHandle, RelaySession};
use crate::config::RelayConfig;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// WebSocket signaling relay
pub struct RelayServer {
    addr: SocketAddr,
    config: RelayConfig,
}

impl RelayServer {
    /// Create a relay from a validated configuration
    pub fn new(config: RelayConfig) -> crate::Result<Self> {
        config.validate()?;
        let addr = config.socket_addr()?;
        Ok(Self { addr, config })
    }

    /// Configured listener address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Bind the listener and start accepting connections
    ///
    /// A fresh relay session is created here and torn down by
    /// [`RelayServerHandle::shutdown`].
    pub async fn start(self) -> crate::Result<RelayServerHandle> {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!("Failed to bind relay to {}: {}", self.addr, e);
            e
        })?;
        let local_addr = listener.local_addr()?;
        info!("Signaling relay listening on ws://{}", local_addr);

        let (relay, session_task) = RelaySession::spawn();
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
        let next_conn = Arc::new(AtomicU64::new(1));
        let outbound_queue = self.config.outbound_queue;

        let accept_relay = relay.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer_addr)) => {
                                let conn = next_conn.fetch_add(1, Ordering::Relaxed);
                                let relay = accept_relay.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(stream, peer_addr, conn, relay, outbound_queue).await {
                                        error!("Relay connection error from {}: {}", peer_addr, e);
                                    }
                                });
                            }
                            Err(e) => {
                                error!("Failed to accept relay connection: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Signaling relay received shutdown signal");
                        break;
                    }
                }
            }

            info!("Signaling relay accept loop exited");
        });

        Ok(RelayServerHandle {
            local_addr,
            relay,
            shutdown_tx,
            accept_task,
            session_task,
        })
    }
}

/// Handle for controlling a running relay
pub struct RelayServerHandle {
    local_addr: SocketAddr,
    relay: RelayHandle,
    shutdown_tx: broadcast::Sender<()>,
    accept_task: JoinHandle<()>,
    session_task: JoinHandle<()>,
}

impl RelayServerHandle {
    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `ws://` URL of this relay
    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    /// Handle to the relay session, for inspection
    pub fn relay(&self) -> RelayHandle {
        self.relay.clone()
    }

    /// Stop accepting, close every connection and tear down the session
    pub async fn shutdown(self) {
        info!("Sending shutdown signal to signaling relay");
        let _ = self.shutdown_tx.send(());
        let _ = self.accept_task.await;

        self.relay.shutdown();
        let _ = self.session_task.await;
        info!("Signaling relay stopped");
    }
}
