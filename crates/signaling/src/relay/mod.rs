//! Signaling relay
//!
//! Routes directed messages between connected identities and implements the
//! join/start protocol of lives:
//!
//! - a message whose `to` names another identity is delivered verbatim to it,
//!   with `peer` set to the sender, whatever its type
//! - `start{stream}` creates the live if needed, marks it started and replays
//!   a `join` to the broadcaster for every viewer already in it
//! - `join{stream}` adds the sender to an existing live and, once the live is
//!   started, forwards the join to `streamer-<stream>`

mod handler;
mod registry;
mod server;
mod session;

pub use registry::{ConnectionId, RelaySnapshot};
pub use server::{RelayServer, RelayServerHandle};
pub use session::{RelayHandle, RelaySession};
