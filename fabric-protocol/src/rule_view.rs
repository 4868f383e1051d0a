//! Shared rule vocabulary and the agent-facing [`RuleView`] projection.

use serde::{Deserialize, Serialize};

/// Topology of a forwarding rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    Direct,
    Entry,
    Chain,
    DirectChain,
    External,
}

/// Transport protocol a rule forwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Tcp,
    Udp,
}

/// Tunnel transport used between hops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelType {
    Ws,
    Tls,
}

/// Preferred IP family for node address resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpVersion {
    #[default]
    Auto,
    Ipv4,
    Ipv6,
}

/// Enabled/disabled lifecycle state of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleStatus {
    Enabled,
    Disabled,
}

/// The role an agent plays for a single rule: first hop, middle hop, or
/// last hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Entry,
    Relay,
    Exit,
}

/// Per-position hop classification derived from `tunnel_hops`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HopMode {
    Tunnel,
    Boundary,
    Direct,
}

/// The minimum-information, role-scoped view of a rule handed to a single
/// agent. Produced by the rule-to-agent converter; never constructed by
/// hand outside of tests.
///
/// Fields are grouped by who needs them: `target_*` only matters to an
/// `exit` viewer, `next_hop_*` only to a non-exit viewer. The converter is
/// responsible for clearing the side that does not apply; this type does
/// not enforce that itself, since it is pure wire data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleView {
    /// Rule SID (`fr_…`).
    pub id: String,
    /// Duplicate of `id`, kept for clients that index by `short_id`.
    pub short_id: String,
    pub rule_type: RuleType,
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen_port: Option<u16>,
    pub protocol: Protocol,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel_type: Option<TunnelType>,

    // Exit-only fields.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_port: Option<u16>,
    /// Entry agent SID, exposed to the exit viewer for handshake
    /// verification.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,

    // Non-exit fields.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_hop_agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_hop_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_hop_ws_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_hop_tls_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_hop_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_hop_connection_token: Option<String>,

    // Chain-wide context, populated for every viewer so each agent can
    // reason about its own position.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub chain_agent_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_position: Option<usize>,
    pub is_last_in_chain: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel_hops: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hop_mode: Option<HopMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inbound_mode: Option<HopMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outbound_mode: Option<HopMode>,
}
