//! Probe task/result payloads exchanged between the probe orchestrator and
//! an agent over the hub channel.

use serde::{Deserialize, Serialize};

/// Kind of probe an agent is asked to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeTaskType {
    /// Plain TCP connect to a literal address.
    Target,
    /// One-shot TCP connect to a peer's direct hop port.
    Tunnel,
    /// A short burst of pings over an already-established tunnel.
    TunnelPing,
}

/// `probe_task` payload (server → agent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeTask {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: ProbeTaskType,
    pub rule_id: String,
    pub target: String,
    pub port: u16,
    pub protocol: String,
    pub timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ping_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ping_interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel_conn_timeout: Option<u64>,
}

/// `probe_result` payload (agent → server).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub task_id: String,
    #[serde(rename = "type")]
    pub task_type: ProbeTaskType,
    pub rule_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packet_loss: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pings_sent: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pings_recv: Option<u32>,
}
