//! Wire envelope for the push/pull protocol.
//!
//! Every frame in both directions is one JSON object:
//! `{ name, request_id?, msg, local_time?, status? }`.
//!
//! A single RPC gets TWO inbound frames with the SAME `request_id`:
//! first an acknowledgment (`name == "result"`, no usable payload), then the
//! data response (any other name). Only the data frame may resolve a call.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Outer name wrapping an inner RPC call.
pub const MSG_SEND: &str = "sendMessage";
/// Subscribe to a server push stream.
pub const MSG_SUBSCRIBE: &str = "subscribeMessage";
/// Tear down a server push stream.
pub const MSG_UNSUBSCRIBE: &str = "unsubscribeMessage";
/// Reserved acknowledgment sentinel. Never resolves a pending request.
pub const MSG_ACK: &str = "result";
/// Periodic server clock push (`msg` is ms since epoch).
pub const MSG_TIME_SYNC: &str = "timeSync";

/// One wire frame, inbound or outbound.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default)]
    pub msg: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl Frame {
    /// A frame with no request identifier (fire-and-forget / subscription).
    pub fn named(name: impl Into<String>, msg: Value) -> Self {
        Self {
            name: name.into(),
            request_id: None,
            msg,
            local_time: None,
            status: None,
        }
    }

    pub fn is_ack(&self) -> bool {
        self.name == MSG_ACK
    }
}

/// Body of a `subscribeMessage` / `unsubscribeMessage` envelope:
/// `{ name, version?, params: { routingFilters }? }`.
pub fn subscription_body(name: &str, version: Option<&str>, routing_filters: Option<Value>) -> Value {
    let mut body = json!({ "name": name });
    if let Some(version) = version {
        body["version"] = json!(version);
    }
    if let Some(filters) = routing_filters {
        body["params"] = json!({ "routingFilters": filters });
    }
    body
}
