//! Relay session: the single task owning the routing registry
//!
//! Connection handlers never touch the registry directly. They post events to
//! the session, which processes each one to completion before the next.

use super::registry::{ConnectionId, Outbound, Registry, RelaySnapshot};
use crate::{Error, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub(crate) enum RelayEvent {
    Connected {
        conn: ConnectionId,
        identity: String,
        outbox: mpsc::Sender<Outbound>,
    },
    Frame {
        conn: ConnectionId,
        text: String,
    },
    Closed {
        conn: ConnectionId,
    },
    Inspect(oneshot::Sender<RelaySnapshot>),
    Shutdown,
}

/// Handle to a running relay session
#[derive(Clone)]
pub struct RelayHandle {
    events: mpsc::UnboundedSender<RelayEvent>,
}

impl RelayHandle {
    pub(crate) fn connected(
        &self,
        conn: ConnectionId,
        identity: String,
        outbox: mpsc::Sender<Outbound>,
    ) -> Result<()> {
        self.post(RelayEvent::Connected {
            conn,
            identity,
            outbox,
        })
    }

    pub(crate) fn frame(&self, conn: ConnectionId, text: String) -> Result<()> {
        self.post(RelayEvent::Frame { conn, text })
    }

    pub(crate) fn closed(&self, conn: ConnectionId) {
        let _ = self.post(RelayEvent::Closed { conn });
    }

    /// Snapshot of identities, live membership and started lives
    pub async fn snapshot(&self) -> Result<RelaySnapshot> {
        let (tx, rx) = oneshot::channel();
        self.post(RelayEvent::Inspect(tx))?;
        rx.await.map_err(|_| Error::RelayStopped)
    }

    /// Close every connection and stop the session
    pub fn shutdown(&self) {
        let _ = self.post(RelayEvent::Shutdown);
    }

    /// Whether the session task is still accepting events
    pub fn is_running(&self) -> bool {
        !self.events.is_closed()
    }

    fn post(&self, event: RelayEvent) -> Result<()> {
        self.events.send(event).map_err(|_| Error::RelayStopped)
    }
}

/// Relay session owning the registry for the lifetime of a listener
pub struct RelaySession {
    registry: Registry,
    events: mpsc::UnboundedReceiver<RelayEvent>,
}

impl RelaySession {
    /// Spawn a session task with an empty registry
    pub fn spawn() -> (RelayHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = RelaySession {
            registry: Registry::new(),
            events: rx,
        };
        let task = tokio::spawn(session.run());
        (RelayHandle { events: tx }, task)
    }

    async fn run(mut self) {
        info!("Relay session started");

        while let Some(event) = self.events.recv().await {
            match event {
                RelayEvent::Connected {
                    conn,
                    identity,
                    outbox,
                } => self.registry.connect(conn, identity, outbox),
                RelayEvent::Frame { conn, text } => match self.registry.receive(conn, &text) {
                    Ok(()) => {}
                    Err(e) if e.is_protocol_error() => {
                        self.registry.evict(conn, &format!("protocol violation: {}", e));
                    }
                    Err(e) => warn!(conn, "Failed to handle frame: {}", e),
                },
                RelayEvent::Closed { conn } => self.registry.disconnect(conn),
                RelayEvent::Inspect(reply) => {
                    let _ = reply.send(self.registry.snapshot());
                }
                RelayEvent::Shutdown => {
                    debug!("Relay session shutting down");
                    break;
                }
            }
        }

        self.registry.close_all("relay shutting down");
        info!("Relay session stopped");
    }
}
