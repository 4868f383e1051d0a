//! The hub message envelope.
//!
//! Every frame that crosses an agent's bidirectional channel, in either
//! direction, is wrapped in the same envelope shape. `data` is left as an
//! opaque JSON value here: the hub dispatches on `msg_type` alone and hands
//! the still-encoded payload to whichever handler claims it, so this crate
//! never needs to know the full set of payload types a deployment runs.

use serde::{Deserialize, Serialize};

/// Built-in agent → server message type names, handled directly by the hub
/// before any pluggable [`MessageHandler`](crate) gets a look.
pub mod agent_msg {
    pub const STATUS: &str = "status";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const EVENT: &str = "event";
    pub const PROBE_RESULT: &str = "probe_result";
    pub const CONFIG_ACK: &str = "config_ack";
    pub const RULE_SYNC_STATUS: &str = "rule_sync_status";
    pub const TUNNEL_HEALTH_REPORT: &str = "tunnel_health_report";
    pub const TRAFFIC: &str = "traffic";
}

/// Server → agent message type names.
pub mod server_msg {
    pub const COMMAND: &str = "command";
    pub const PROBE_TASK: &str = "probe_task";
    pub const CONFIG_SYNC: &str = "config_sync";
}

/// `{ "type", "agent_id", "timestamp", "data" }` as described in the wire
/// protocol. `agent_id` is the SID of whichever agent this envelope is
/// addressed to (server → agent) or originates from (agent → server).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub agent_id: String,
    pub timestamp: i64,
    pub data: serde_json::Value,
}

impl Envelope {
    /// Builds an envelope, serializing `data` via its `Serialize` impl.
    ///
    /// Returns `Err` only if `data`'s `Serialize` implementation fails,
    /// which does not happen for the plain-data payload types in this
    /// crate; callers that construct envelopes from those types may
    /// safely `.expect()` in tests but should propagate the error in
    /// production code paths that accept arbitrary payloads.
    pub fn new(
        msg_type: impl Into<String>,
        agent_id: impl Into<String>,
        timestamp: i64,
        data: impl Serialize,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            msg_type: msg_type.into(),
            agent_id: agent_id.into(),
            timestamp,
            data: serde_json::to_value(data)?,
        })
    }

    /// Decodes `data` into a concrete payload type.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }
}
