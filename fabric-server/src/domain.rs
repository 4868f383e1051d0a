//! Core entities owned by the repositories (§3 of the spec): forwarding
//! rules, forwarding agents and nodes. These are plain data; the converter,
//! sync engine and hub never hold long-lived references into them, they
//! re-read through a repository on every projection.

use std::collections::HashMap;

use fabric_protocol::{IpVersion, Protocol, RuleStatus, RuleType, TunnelType};

use crate::error::{CoreError, CoreResult};

/// Internal numeric identifier. Never crosses the wire; the SID does.
pub type EntityId = u64;

/// A declarative forwarding contract owned by the server.
#[derive(Debug, Clone)]
pub struct ForwardingRule {
    pub id: EntityId,
    pub sid: String,
    pub rule_type: RuleType,
    pub agent_id: EntityId,
    pub exit_agent_id: Option<EntityId>,
    pub chain_agent_ids: Vec<EntityId>,
    pub chain_port_config: HashMap<EntityId, u16>,
    pub listen_port: u16,
    pub target_address: String,
    pub target_port: u16,
    pub target_node_id: Option<EntityId>,
    pub bind_ip: Option<String>,
    pub protocol: Protocol,
    pub tunnel_type: TunnelType,
    /// `None` means the full chain tunnels; `Some(n)` means only the first
    /// `n` hops do.
    pub tunnel_hops: Option<u32>,
    pub ip_version: IpVersion,
    pub status: RuleStatus,
    pub upload_bytes: u64,
    pub download_bytes: u64,
    pub traffic_multiplier: f64,
    pub user_id: Option<EntityId>,
    pub subscription_id: Option<EntityId>,
}

impl ForwardingRule {
    /// The full chain used for position math: `[agent_id] ++
    /// chain_agent_ids`. Valid for every rule type, not just `chain`/
    /// `direct_chain` — for `direct`/`entry` it degenerates to just the
    /// owning agent (plus exit, conceptually, but `entry` is handled
    /// separately since it is not positional).
    pub fn full_chain(&self) -> Vec<EntityId> {
        let mut chain = Vec::with_capacity(1 + self.chain_agent_ids.len());
        chain.push(self.agent_id);
        chain.extend(self.chain_agent_ids.iter().copied());
        chain
    }

    /// Enforces the invariants listed in spec §3.
    pub fn validate(&self) -> CoreResult<()> {
        match self.rule_type {
            RuleType::Entry => {
                if self.exit_agent_id.is_none() {
                    return Err(CoreError::ValidationFailed(
                        "entry rule requires exit_agent_id".into(),
                    ));
                }
            }
            RuleType::Chain | RuleType::DirectChain => {
                if self.chain_agent_ids.is_empty() {
                    return Err(CoreError::ValidationFailed(
                        "chain rule requires a non-empty chain_agent_ids".into(),
                    ));
                }
                if self.chain_agent_ids.contains(&self.agent_id) {
                    return Err(CoreError::ValidationFailed(
                        "chain_agent_ids must not duplicate the owning agent".into(),
                    ));
                }
                if self.rule_type == RuleType::DirectChain {
                    for peer in &self.chain_agent_ids {
                        if !self.chain_port_config.contains_key(peer) {
                            return Err(CoreError::ValidationFailed(format!(
                                "direct_chain rule missing chain_port_config entry for agent {peer}"
                            )));
                        }
                    }
                }
            }
            RuleType::Direct | RuleType::External => {}
        }
        Ok(())
    }
}

/// An edge process that terminates client traffic and forwards it onward.
#[derive(Debug, Clone)]
pub struct ForwardingAgent {
    pub id: EntityId,
    pub sid: String,
    pub public_address: String,
    pub tunnel_address: Option<String>,
    pub token_hash: String,
    pub status: AgentRecordStatus,
    pub platform: String,
    pub arch: String,
    pub agent_version: String,
    pub allowed_port_range: Option<(u16, u16)>,
    pub blocked_protocols: Vec<Protocol>,
    /// Unix epoch seconds of the agent's last reported heartbeat/status.
    pub last_seen_at: i64,
    pub group_ids: Vec<EntityId>,
}

/// Administrative enable/disable state of an agent record, independent of
/// whether it currently has a live hub session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentRecordStatus {
    Active,
    Disabled,
}

impl ForwardingAgent {
    /// `tunnel_address` if non-empty, else `public_address` (§3).
    pub fn effective_tunnel_address(&self) -> &str {
        match &self.tunnel_address {
            Some(addr) if !addr.is_empty() => addr,
            _ => &self.public_address,
        }
    }

    /// Freshness half of the "online" definition (§3, §9): `last_seen_at`
    /// within `staleness_window_secs` of `now`. The other half — a live
    /// hub session — is checked by the caller against the hub registry.
    pub fn is_recently_seen(&self, now: i64, staleness_window_secs: i64) -> bool {
        now.saturating_sub(self.last_seen_at) <= staleness_window_secs
    }
}

/// A logical target endpoint resolved to a concrete address at connect
/// time.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: EntityId,
    pub sid: String,
    pub server_address: String,
    pub public_ipv4: Option<String>,
    pub public_ipv6: Option<String>,
    pub agent_port: u16,
}

fn is_valid_literal_address(addr: &str) -> bool {
    !addr.is_empty() && addr != "0.0.0.0" && addr != "::"
}

impl Node {
    /// Resolves the address to hand to an agent, honoring the preferred IP
    /// family per spec §3.
    pub fn resolve_address(&self, preferred: IpVersion) -> Option<String> {
        let server = is_valid_literal_address(&self.server_address).then(|| self.server_address.clone());
        let v4 = self.public_ipv4.clone();
        let v6 = self.public_ipv6.clone();

        let order: [Option<String>; 3] = match preferred {
            IpVersion::Auto => [server, v4, v6],
            IpVersion::Ipv4 => [v4, server, v6],
            IpVersion::Ipv6 => [v6, server, v4],
        };
        order.into_iter().flatten().next()
    }
}
