//! The volatile `status` payload an agent reports on its own heartbeat
//! schedule, cached by the server and consulted by the converter and probe
//! orchestrator (for WS/TLS listen ports).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-rule tunnel health as last reported by the agent that owns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelStatusEntry {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// `status` message payload (agent → server).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatusReport {
    pub cpu_percent: f32,
    pub mem_percent: f32,
    pub disk_percent: f32,
    pub uptime_secs: u64,
    pub active_rule_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_listen_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_listen_port: Option<u16>,
    #[serde(default)]
    pub tunnel_status: HashMap<String, TunnelStatusEntry>,
    pub version: String,
    pub platform: String,
    pub arch: String,
}
