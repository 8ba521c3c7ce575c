//! Signaling transports
//!
//! A transport is a bidirectional, ordered, message-oriented channel bound to
//! one participant identity. Two implementations are interchangeable at the
//! protocol level:
//! - [`WebSocketSignaling`] talks to the relay server
//! - [`LocalSignaling`] talks to other participants in the same process
//!   through a [`LocalHub`], without any relay

mod local;
mod websocket;

pub use local::{LocalHub, LocalSignaling};
pub use websocket::WebSocketSignaling;

use crate::protocol::SignalMessage;
use crate::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Capacity of the inbound fan-out channel of every transport
pub const INBOUND_CAPACITY: usize = 1024;

/// Bidirectional signaling channel bound to one participant identity
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Identity this transport is bound to
    fn identity(&self) -> &str;

    /// Send one message; delivery is best effort
    async fn send(&self, message: SignalMessage) -> Result<()>;

    /// Subscribe to inbound messages
    ///
    /// Dropping the receiver unsubscribes.
    fn subscribe(&self) -> broadcast::Receiver<SignalMessage>;

    /// Close the transport; later sends fail with `TransportClosed`
    async fn close(&self) -> Result<()>;

    /// Whether the transport is still usable
    fn is_open(&self) -> bool;
}
