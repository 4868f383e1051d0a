//! # Rule-to-Agent Converter (spec §4.2)
//!
//! A pure projection `Convert(rule, viewer_agent_id) -> RuleView`. The only
//! side effects are read-only lookups of agents, nodes and cached agent
//! status through the repository/cache traits — never a write, never a
//! mutation of the rule itself.

use std::sync::Arc;

use fabric_protocol::{HopMode, Role, RuleType, RuleView, TunnelType};
use tracing::warn;

use crate::cache::AgentStatusCache;
use crate::domain::{EntityId, ForwardingAgent, ForwardingRule};
use crate::error::{CoreError, CoreResult};
use crate::repository::{AgentRepository, NodeRepository};
use crate::token::TokenService;

pub struct RuleToAgentConverter {
    agents: Arc<dyn AgentRepository>,
    nodes: Arc<dyn NodeRepository>,
    status_cache: Arc<dyn AgentStatusCache>,
    tokens: Arc<TokenService>,
}

/// Per-position hop classification derived from `tunnel_hops` (spec §4.2).
///
/// - `tunnel_hops == None`: every hop tunnels.
/// - `0 <= pos < hops - 1`: inbound and outbound both tunnel.
/// - `pos == hops - 1`: the boundary hop — inbound tunnels, outbound is direct.
/// - `pos >= hops`: both directions are direct.
pub(crate) fn hop_mode_at(position: usize, tunnel_hops: Option<u32>) -> (HopMode, HopMode) {
    let Some(hops) = tunnel_hops else {
        return (HopMode::Tunnel, HopMode::Tunnel);
    };
    let hops = hops as usize;
    if hops == 0 {
        return (HopMode::Direct, HopMode::Direct);
    }
    if position < hops.saturating_sub(1) {
        (HopMode::Tunnel, HopMode::Tunnel)
    } else if position == hops - 1 {
        (HopMode::Tunnel, HopMode::Direct)
    } else {
        (HopMode::Direct, HopMode::Direct)
    }
}

/// Collapses an inbound/outbound pair into the single `hop_mode` summary
/// field: `tunnel` if both tunnel, `direct` if both direct, `boundary`
/// otherwise.
fn combined_hop_mode(inbound: HopMode, outbound: HopMode) -> HopMode {
    match (inbound, outbound) {
        (HopMode::Tunnel, HopMode::Tunnel) => HopMode::Tunnel,
        (HopMode::Direct, HopMode::Direct) => HopMode::Direct,
        _ => HopMode::Boundary,
    }
}

impl RuleToAgentConverter {
    pub fn new(
        agents: Arc<dyn AgentRepository>,
        nodes: Arc<dyn NodeRepository>,
        status_cache: Arc<dyn AgentStatusCache>,
        tokens: Arc<TokenService>,
    ) -> Self {
        Self {
            agents,
            nodes,
            status_cache,
            tokens,
        }
    }

    /// Resolves the rule's target, substituting a node's resolved address
    /// when `target_node_id` is set. Node-lookup failure is not fatal —
    /// the rule's literal target is retained and a warning logged (spec
    /// §4.2).
    async fn resolve_target(&self, rule: &ForwardingRule) -> (String, u16) {
        let Some(node_id) = rule.target_node_id else {
            return (rule.target_address.clone(), rule.target_port);
        };
        match self.nodes.get(node_id).await {
            Ok(node) => {
                let address = node
                    .resolve_address(rule.ip_version)
                    .unwrap_or_else(|| rule.target_address.clone());
                let port = if rule.target_port == 0 {
                    node.agent_port
                } else {
                    rule.target_port
                };
                (address, port)
            }
            Err(e) => {
                warn!(
                    rule = %rule.sid,
                    node_id,
                    error = %e,
                    "node lookup failed, retaining literal target address"
                );
                (rule.target_address.clone(), rule.target_port)
            }
        }
    }

    async fn next_hop_fields(
        &self,
        next_agent: &ForwardingAgent,
        outbound: HopMode,
        direct_port: Option<u16>,
    ) -> CoreResult<(Option<u16>, Option<String>, Option<u16>, Option<u16>)> {
        match outbound {
            HopMode::Direct | HopMode::Boundary => {
                let token = self
                    .tokens
                    .generate(&next_agent.sid)
                    .map_err(|e| CoreError::ProbeFailed(e.to_string()))?;
                Ok((direct_port, Some(token), None, None))
            }
            HopMode::Tunnel => {
                let status = self.status_cache.get(next_agent.id).await;
                let ws = status.as_ref().and_then(|s| s.ws_listen_port);
                let tls = status.as_ref().and_then(|s| s.tls_listen_port);
                Ok((None, None, ws, tls))
            }
        }
    }

    /// Projects `rule` for `viewer_agent_id`. Returns `Err` only if the
    /// viewer is not actually a participant in the rule, or a required
    /// agent lookup fails — a node lookup failure never fails the
    /// projection (see `resolve_target`).
    pub async fn convert(&self, rule: &ForwardingRule, viewer_agent_id: EntityId) -> CoreResult<RuleView> {
        match rule.rule_type {
            RuleType::Direct | RuleType::External => self.convert_direct(rule, viewer_agent_id).await,
            RuleType::Entry => self.convert_entry(rule, viewer_agent_id).await,
            RuleType::Chain | RuleType::DirectChain => self.convert_chain(rule, viewer_agent_id).await,
        }
    }

    async fn convert_direct(&self, rule: &ForwardingRule, viewer_agent_id: EntityId) -> CoreResult<RuleView> {
        if viewer_agent_id != rule.agent_id {
            return Err(CoreError::ValidationFailed(format!(
                "agent {viewer_agent_id} is not a participant in rule {}",
                rule.sid
            )));
        }
        let (target_address, target_port) = self.resolve_target(rule).await;
        Ok(base_view(
            rule,
            Role::Entry,
            Some(rule.listen_port),
            Some(target_address),
            Some(target_port),
            None,
        ))
    }

    async fn convert_entry(&self, rule: &ForwardingRule, viewer_agent_id: EntityId) -> CoreResult<RuleView> {
        let exit_agent_id = rule
            .exit_agent_id
            .ok_or_else(|| CoreError::ValidationFailed("entry rule missing exit_agent_id".into()))?;

        if viewer_agent_id == rule.agent_id {
            // Viewer is the entry agent: next hop is the exit agent.
            let exit_agent = self.agents.get(exit_agent_id).await?;
            let (next_hop_port, next_hop_token, ws, tls) = self
                .next_hop_fields(&exit_agent, HopMode::Tunnel, None)
                .await?;
            let mut view = base_view(rule, Role::Entry, Some(rule.listen_port), None, None, None);
            view.next_hop_agent_id = Some(exit_agent.sid.clone());
            view.next_hop_address = Some(exit_agent.effective_tunnel_address().to_string());
            view.next_hop_ws_port = ws;
            view.next_hop_tls_port = tls;
            view.next_hop_port = next_hop_port;
            view.next_hop_connection_token = next_hop_token;
            Ok(view)
        } else if viewer_agent_id == exit_agent_id {
            // Viewer is the exit agent: expose target + entry SID for
            // handshake verification.
            let entry_agent = self.agents.get(rule.agent_id).await?;
            let (target_address, target_port) = self.resolve_target(rule).await;
            let mut view = base_view(
                rule,
                Role::Exit,
                None,
                Some(target_address),
                Some(target_port),
                None,
            );
            view.agent_id = Some(entry_agent.sid);
            Ok(view)
        } else {
            Err(CoreError::ValidationFailed(format!(
                "agent {viewer_agent_id} is not a participant in rule {}",
                rule.sid
            )))
        }
    }

    async fn convert_chain(&self, rule: &ForwardingRule, viewer_agent_id: EntityId) -> CoreResult<RuleView> {
        let full_chain = rule.full_chain();
        let position = full_chain
            .iter()
            .position(|id| *id == viewer_agent_id)
            .ok_or_else(|| {
                CoreError::ValidationFailed(format!(
                    "agent {viewer_agent_id} is not a participant in rule {}",
                    rule.sid
                ))
            })?;
        let is_last = position == full_chain.len() - 1;
        let role = if position == 0 {
            Role::Entry
        } else if is_last {
            Role::Exit
        } else {
            Role::Relay
        };

        let direct_chain = rule.rule_type == RuleType::DirectChain;
        let (inbound, outbound) = if direct_chain {
            (HopMode::Direct, HopMode::Direct)
        } else {
            hop_mode_at(position, rule.tunnel_hops)
        };

        // Open question resolution (spec §9): pos 0 keeps rule.listen_port;
        // pos > 0 in direct mode uses chain_port_config[viewer]; pos > 0 in
        // tunnel/boundary mode clears listen_port (tunnel receive uses the
        // WS/TLS port instead).
        let listen_port = if position == 0 {
            Some(rule.listen_port)
        } else if inbound == HopMode::Direct {
            rule.chain_port_config.get(&viewer_agent_id).copied()
        } else {
            None
        };

        let mut agent_sids = Vec::with_capacity(full_chain.len());
        for id in &full_chain {
            agent_sids.push(self.agents.get(*id).await?.sid);
        }

        let mut view = if is_last {
            let (target_address, target_port) = self.resolve_target(rule).await;
            base_view(rule, role, listen_port, Some(target_address), Some(target_port), None)
        } else {
            base_view(rule, role, listen_port, None, None, None)
        };
        view.chain_agent_ids = agent_sids;
        view.chain_position = Some(position);
        view.is_last_in_chain = is_last;
        view.hop_mode = Some(combined_hop_mode(inbound, outbound));
        view.inbound_mode = Some(inbound);
        view.outbound_mode = Some(outbound);

        if !is_last {
            let next_agent_id = full_chain[position + 1];
            let next_agent = self.agents.get(next_agent_id).await?;
            let direct_port = if direct_chain || outbound == HopMode::Direct {
                rule.chain_port_config.get(&next_agent_id).copied()
            } else {
                None
            };
            let (next_hop_port, next_hop_token, ws, tls) =
                self.next_hop_fields(&next_agent, outbound, direct_port).await?;
            view.next_hop_agent_id = Some(next_agent.sid.clone());
            view.next_hop_address = Some(next_agent.effective_tunnel_address().to_string());
            view.next_hop_ws_port = ws;
            view.next_hop_tls_port = tls;
            view.next_hop_port = next_hop_port;
            view.next_hop_connection_token = next_hop_token;
        }

        Ok(view)
    }
}

/// Builds the common scaffold of a view; chain-specific fields are filled
/// in by the caller.
fn base_view(
    rule: &ForwardingRule,
    role: Role,
    listen_port: Option<u16>,
    target_address: Option<String>,
    target_port: Option<u16>,
    agent_sid: Option<String>,
) -> RuleView {
    RuleView {
        id: rule.sid.clone(),
        short_id: rule.sid.clone(),
        rule_type: rule.rule_type,
        role,
        listen_port,
        protocol: rule.protocol,
        bind_ip: rule.bind_ip.clone(),
        tunnel_type: Some(rule.tunnel_type),
        target_address,
        target_port,
        agent_id: agent_sid,
        next_hop_agent_id: None,
        next_hop_address: None,
        next_hop_ws_port: None,
        next_hop_tls_port: None,
        next_hop_port: None,
        next_hop_connection_token: None,
        chain_agent_ids: Vec::new(),
        chain_position: None,
        is_last_in_chain: false,
        tunnel_hops: rule.tunnel_hops,
        hop_mode: None,
        inbound_mode: None,
        outbound_mode: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryAgentStatusCache;
    use crate::domain::AgentRecordStatus;
    use crate::repository::{InMemoryAgentRepository, InMemoryNodeRepository, AgentRepository as _};
    use fabric_protocol::{IpVersion, Protocol, RuleStatus};
    use std::collections::HashMap;
    use std::time::Duration;

    fn agent(id: EntityId, sid: &str) -> ForwardingAgent {
        ForwardingAgent {
            id,
            sid: sid.to_string(),
            public_address: format!("10.0.0.{id}"),
            tunnel_address: None,
            token_hash: String::new(),
            status: AgentRecordStatus::Active,
            platform: "linux".into(),
            arch: "x86_64".into(),
            agent_version: "1.0.0".into(),
            allowed_port_range: None,
            blocked_protocols: Vec::new(),
            last_seen_at: 0,
            group_ids: Vec::new(),
        }
    }

    fn direct_rule() -> ForwardingRule {
        ForwardingRule {
            id: 1,
            sid: "fr_A".into(),
            rule_type: RuleType::Direct,
            agent_id: 1,
            exit_agent_id: None,
            chain_agent_ids: Vec::new(),
            chain_port_config: HashMap::new(),
            listen_port: 8080,
            target_address: "10.0.0.5".into(),
            target_port: 80,
            target_node_id: None,
            bind_ip: None,
            protocol: Protocol::Tcp,
            tunnel_type: TunnelType::Ws,
            tunnel_hops: None,
            ip_version: IpVersion::Auto,
            status: RuleStatus::Enabled,
            upload_bytes: 0,
            download_bytes: 0,
            traffic_multiplier: 1.0,
            user_id: None,
            subscription_id: None,
        }
    }

    async fn converter_with(agents: Vec<ForwardingAgent>) -> RuleToAgentConverter {
        let agent_repo = Arc::new(InMemoryAgentRepository::new());
        for a in agents {
            agent_repo.upsert(a).await.unwrap();
        }
        RuleToAgentConverter::new(
            agent_repo,
            Arc::new(InMemoryNodeRepository::new()),
            Arc::new(InMemoryAgentStatusCache::new()),
            Arc::new(TokenService::new(b"secret".to_vec(), Duration::from_secs(60))),
        )
    }

    #[tokio::test]
    async fn direct_rule_exposes_target_to_entry_agent() {
        let conv = converter_with(vec![agent(1, "fa_1")]).await;
        let view = conv.convert(&direct_rule(), 1).await.unwrap();
        assert_eq!(view.role, Role::Entry);
        assert_eq!(view.target_address.as_deref(), Some("10.0.0.5"));
        assert!(view.next_hop_agent_id.is_none());
    }

    #[tokio::test]
    async fn chain_positions_and_hop_modes_match_hybrid_example() {
        // fr_D: chain [fa_1, fa_2, fa_3, fa_4], tunnel_hops = 2.
        let conv = converter_with(vec![
            agent(1, "fa_1"),
            agent(2, "fa_2"),
            agent(3, "fa_3"),
            agent(4, "fa_4"),
        ])
        .await;
        let mut rule = direct_rule();
        rule.rule_type = RuleType::Chain;
        rule.agent_id = 1;
        rule.chain_agent_ids = vec![2, 3, 4];
        rule.tunnel_hops = Some(2);

        let v0 = conv.convert(&rule, 1).await.unwrap();
        assert_eq!(v0.hop_mode, Some(HopMode::Tunnel));
        assert_eq!(v0.chain_position, Some(0));

        let v1 = conv.convert(&rule, 2).await.unwrap();
        assert_eq!(v1.hop_mode, Some(HopMode::Boundary));
        assert_eq!(v1.inbound_mode, Some(HopMode::Tunnel));
        assert_eq!(v1.outbound_mode, Some(HopMode::Direct));

        let v2 = conv.convert(&rule, 3).await.unwrap();
        assert_eq!(v2.hop_mode, Some(HopMode::Direct));
        assert!(!v2.is_last_in_chain);

        let v3 = conv.convert(&rule, 4).await.unwrap();
        assert_eq!(v3.hop_mode, Some(HopMode::Direct));
        assert!(v3.is_last_in_chain);
        assert_eq!(v3.chain_position, Some(3));
    }

    #[tokio::test]
    async fn non_exit_viewer_has_target_cleared_and_exit_has_next_hop_cleared() {
        let conv = converter_with(vec![agent(1, "fa_1"), agent(2, "fa_2")]).await;
        let mut rule = direct_rule();
        rule.rule_type = RuleType::Entry;
        rule.agent_id = 1;
        rule.exit_agent_id = Some(2);

        let entry_view = conv.convert(&rule, 1).await.unwrap();
        assert!(entry_view.target_address.is_none());
        assert!(entry_view.next_hop_agent_id.is_some());

        let exit_view = conv.convert(&rule, 2).await.unwrap();
        assert!(exit_view.next_hop_agent_id.is_none());
        assert!(exit_view.target_address.is_some());
        assert_eq!(exit_view.agent_id.as_deref(), Some("fa_1"));
    }
}
