//! Broadcaster metadata carried over the `metadata` data channel
//!
//! Every payload is a JSON object. Viewers shallow-merge each payload into
//! their current view, so a key is only ever overwritten, never removed.
//! The broadcaster always includes a `streams` entry naming the stream id
//! of its camera and screen sources.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key under which the broadcaster publishes its source stream ids
pub const STREAMS_KEY: &str = "streams";

/// Metadata object as seen by a viewer
pub type Metadata = Map<String, Value>;

/// Stream ids of the broadcaster's sources
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamIds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen: Option<String>,
}

impl StreamIds {
    /// Read the `streams` entry from a metadata object
    pub fn from_metadata(metadata: &Metadata) -> Option<Self> {
        metadata
            .get(STREAMS_KEY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Parse a data channel payload into a metadata update
pub fn parse_update(data: &[u8]) -> Result<Metadata> {
    match serde_json::from_slice::<Value>(data)? {
        Value::Object(map) => Ok(map),
        other => Err(Error::DataChannelError(format!(
            "metadata payload must be a JSON object, got {}",
            json_kind(&other)
        ))),
    }
}

/// Shallow-merge `update` into `target`; returns whether anything changed
pub fn merge(target: &mut Metadata, update: Metadata) -> bool {
    let mut changed = false;
    for (key, value) in update {
        if target.get(&key) != Some(&value) {
            target.insert(key, value);
            changed = true;
        }
    }
    changed
}

/// Payload the broadcaster sends: application keys plus `streams`
pub fn compose(app: &Metadata, streams: &StreamIds) -> Result<Value> {
    let mut payload = app.clone();
    payload.insert(STREAMS_KEY.to_string(), serde_json::to_value(streams)?);
    Ok(Value::Object(payload))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
