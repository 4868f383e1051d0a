//! Miscellaneous agent-reported payloads that do not warrant their own
//! module: generic lifecycle `event`s, per-rule `rule_sync_status`, and
//! `tunnel_health_report`.

use serde::{Deserialize, Serialize};

/// `event` payload (agent → server). Free-form; the server logs these and
/// may forward them to monitoring, but the core control plane does not
/// interpret `kind` beyond routing to handlers that care about it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    pub kind: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// `rule_sync_status` payload (agent → server): the agent's own report of
/// whether it managed to apply a previously pushed rule view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSyncStatusPayload {
    pub rule_id: String,
    pub applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `tunnel_health_report` payload (agent → server).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelHealthReportPayload {
    pub rule_id: String,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}
