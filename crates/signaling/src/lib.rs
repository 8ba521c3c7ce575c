//! Signaling for one-to-many live streaming
//!
//! Participants of a live cannot reach each other directly until their peer
//! sessions are negotiated, so offers, answers and network candidates travel
//! over a signaling channel first. This crate provides:
//!
//! - **Wire protocol**: one JSON object per frame, tagged by `type`
//!   (`offer`, `answer`, `candidate`, `join`, `start`)
//! - **Signaling transports**: a WebSocket client bound to the relay, and an
//!   in-process hub for participants living in the same process
//! - **Relay**: a WebSocket server routing directed messages between
//!   identities and implementing the join/start protocol of lives
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   join/answer/candidate   ┌──────────────┐
//! │ Viewer v1    │ ────────────────────────► │              │
//! │ (transport)  │ ◄──────────────────────── │    Relay     │
//! └──────────────┘        offer/candidate    │  RelaySession│
//! ┌──────────────┐                           │  └─ Registry │
//! │ streamer-demo│ ◄───── join{peer: v1} ─── │              │
//! │ (transport)  │ ──── start / offer ─────► │              │
//! └──────────────┘                           └──────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use livecast_signaling::{RelayConfig, RelayServer, SignalMessage, SignalingTransport, WebSocketSignaling};
//!
//! # async fn example() -> livecast_signaling::Result<()> {
//! let server = RelayServer::new(RelayConfig::default().with_bind_address("127.0.0.1:3000"))?;
//! let handle = server.start().await?;
//!
//! let streamer = WebSocketSignaling::connect("ws://127.0.0.1:3000", "streamer-demo").await?;
//! streamer.send(SignalMessage::start("demo")).await?;
//!
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod protocol;
pub mod relay;
pub mod transport;

pub use config::RelayConfig;
pub use error::{Error, Result};
pub use protocol::{
    live_of_streamer, streamer_identity, IceCandidate, SdpType, SessionDescription,
    SignalMessage, STREAMER_PREFIX,
};
pub use relay::{RelayHandle, RelayServer, RelayServerHandle, RelaySnapshot};
pub use transport::{LocalHub, LocalSignaling, SignalingTransport, WebSocketSignaling};
