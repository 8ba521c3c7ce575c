//! Data channels
//!
//! - [`RtcDataLink`] - webrtc-rs data channel feeding a link's event stream
//! - [`metadata`] - the JSON object broadcast on the `metadata` channel

mod data_channel;
pub mod metadata;

pub use data_channel::{DataChannelState, RtcDataLink};
pub use metadata::{Metadata, StreamIds, STREAMS_KEY};
