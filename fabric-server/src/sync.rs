//! # Configuration Synchronization Engine (spec §4.4)
//!
//! Versioned full and incremental pushes over the hub's per-agent queue.
//! `global_version` is a single atomic counter shared by every envelope
//! this process sends to any agent; `agent_versions` is the concurrent map
//! of each agent's last-sent-or-acked version. Both are exposed as small
//! injectable pieces (per the spec's "Global mutable state" design note)
//! rather than buried inside one god struct.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use fabric_protocol::{server_msg, ChangeType, ConfigSyncPayload, Envelope, RuleType};
use tracing::{info, warn};

use crate::converter::RuleToAgentConverter;
use crate::domain::{EntityId, ForwardingRule};
use crate::error::CoreResult;
use crate::hub::AgentHub;
use crate::repository::{AgentRepository, RuleRepository};
use crate::token::TokenService;

/// Process-wide monotonic envelope version counter.
#[derive(Default)]
pub struct GlobalVersion(AtomicU64);

impl GlobalVersion {
    pub fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    /// Returns the next version and advances the counter. Strictly
    /// increasing across the whole process (spec testable property 4).
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}

/// Process-wide map of each agent's last-sent-or-acked config version.
#[derive(Default)]
pub struct AgentVersions(DashMap<EntityId, u64>);

impl AgentVersions {
    pub fn new() -> Self {
        Self(DashMap::new())
    }

    pub fn get(&self, agent_id: EntityId) -> Option<u64> {
        self.0.get(&agent_id).map(|v| *v)
    }

    fn record_sent(&self, agent_id: EntityId, version: u64) {
        self.0.insert(agent_id, version);
    }

    /// Records an ack. A higher version replaces a lower one; a lower ack
    /// (arriving out of order) is still recorded as having been seen but
    /// never regresses the stored value (spec §5 ordering guarantees).
    fn record_ack(&self, agent_id: EntityId, version: u64) {
        self.0
            .entry(agent_id)
            .and_modify(|current| {
                if version > *current {
                    *current = version;
                }
            })
            .or_insert(version);
    }
}

pub struct ConfigSyncEngine {
    hub: Arc<AgentHub>,
    rules: Arc<dyn RuleRepository>,
    agents: Arc<dyn AgentRepository>,
    converter: Arc<RuleToAgentConverter>,
    tokens: Arc<TokenService>,
    pub global_version: Arc<GlobalVersion>,
    pub agent_versions: Arc<AgentVersions>,
}

impl ConfigSyncEngine {
    pub fn new(
        hub: Arc<AgentHub>,
        rules: Arc<dyn RuleRepository>,
        agents: Arc<dyn AgentRepository>,
        converter: Arc<RuleToAgentConverter>,
        tokens: Arc<TokenService>,
        global_version: Arc<GlobalVersion>,
        agent_versions: Arc<AgentVersions>,
    ) -> Self {
        Self {
            hub,
            rules,
            agents,
            converter,
            tokens,
            global_version,
            agent_versions,
        }
    }

    /// The de-duplicated set of rules in which `agent_id` participates in
    /// any role: owner, exit, or chain member.
    async fn applicable_rules_for(&self, agent_id: EntityId) -> CoreResult<Vec<ForwardingRule>> {
        let mut by_id: HashMap<EntityId, ForwardingRule> = HashMap::new();
        for rule in self.rules.owned_by(agent_id).await? {
            by_id.insert(rule.id, rule);
        }
        for rule in self.rules.exited_by(agent_id).await? {
            by_id.insert(rule.id, rule);
        }
        for rule in self.rules.chain_participant(agent_id).await? {
            by_id.insert(rule.id, rule);
        }
        Ok(by_id.into_values().collect())
    }

    fn send_envelope(&self, agent_id: EntityId, agent_sid: &str, payload: ConfigSyncPayload) {
        let version = payload.version;
        match Envelope::new(server_msg::CONFIG_SYNC, agent_sid, now_ts(), payload) {
            Ok(envelope) => match self.hub.send_message_to_agent(agent_id, envelope) {
                Ok(()) => self.agent_versions.record_sent(agent_id, version),
                Err(e) => {
                    // Logged, not fatal: the next change or reconnect heals
                    // this agent (spec §7).
                    warn!(agent_id, error = %e, "failed to send config sync, will heal on next change or reconnect");
                }
            },
            Err(e) => warn!(agent_id, error = %e, "failed to encode config sync envelope"),
        }
    }

    /// `FullSyncToAgent`: called from `OnAgentOnline` and on explicit
    /// reload. A no-op if the agent is not online.
    pub async fn full_sync_to_agent(&self, agent_id: EntityId) -> CoreResult<()> {
        if !self.hub.has_session(agent_id) {
            return Ok(());
        }
        let agent_sid = self.agents.get(agent_id).await?.sid;
        let rules = self.applicable_rules_for(agent_id).await?;
        let mut views = Vec::with_capacity(rules.len());
        for rule in &rules {
            views.push(self.converter.convert(rule, agent_id).await?);
        }
        let client_token = self.tokens.generate(&agent_sid)?;
        let version = self.global_version.next();
        info!(agent_id, rules = views.len(), version, "full sync");
        self.send_envelope(
            agent_id,
            &agent_sid,
            ConfigSyncPayload {
                version,
                full_sync: true,
                added: views,
                updated: Vec::new(),
                removed: Vec::new(),
                client_token: Some(client_token),
            },
        );
        Ok(())
    }

    /// `NotifyRuleChange`: incremental sync for a single rule. A no-op if
    /// the agent is offline.
    pub async fn notify_rule_change(
        &self,
        agent_id: EntityId,
        rule_sid: &str,
        change: ChangeType,
    ) -> CoreResult<()> {
        if !self.hub.has_session(agent_id) {
            return Ok(());
        }
        let agent_sid = self.agents.get(agent_id).await?.sid;
        let version = self.global_version.next();
        let payload = match change {
            ChangeType::Removed => ConfigSyncPayload {
                version,
                full_sync: false,
                added: Vec::new(),
                updated: Vec::new(),
                removed: vec![rule_sid.to_string()],
                client_token: None,
            },
            ChangeType::Added | ChangeType::Updated => {
                let rule = self.rules.get_by_sid(rule_sid).await?;
                let view = self.converter.convert(&rule, agent_id).await?;
                let mut payload = ConfigSyncPayload {
                    version,
                    full_sync: false,
                    added: Vec::new(),
                    updated: Vec::new(),
                    removed: Vec::new(),
                    client_token: None,
                };
                if change == ChangeType::Added {
                    payload.added.push(view);
                } else {
                    payload.updated.push(view);
                }
                payload
            }
        };
        self.send_envelope(agent_id, &agent_sid, payload);
        Ok(())
    }

    /// True if `rule`, viewed from `viewer_agent_id`, has `peer_id` as its
    /// immediate next hop — the condition under which a peer's port or
    /// address change invalidates this rule's projection for the viewer.
    fn transits_peer(rule: &ForwardingRule, viewer_agent_id: EntityId, peer_id: EntityId) -> bool {
        match rule.rule_type {
            RuleType::Entry if rule.agent_id == viewer_agent_id => rule.exit_agent_id == Some(peer_id),
            RuleType::Chain | RuleType::DirectChain => {
                let chain = rule.full_chain();
                chain
                    .iter()
                    .position(|id| *id == viewer_agent_id)
                    .and_then(|pos| chain.get(pos + 1))
                    .is_some_and(|next| *next == peer_id)
            }
            _ => false,
        }
    }

    /// Shared implementation for `NotifyExitPortChange` /
    /// `NotifyAgentAddressChange`: re-converts only the rules that transit
    /// through `peer_id` for each affected agent and sends them as
    /// `updated`, never a full sync.
    async fn notify_peer_change(&self, affected: HashSet<EntityId>, peer_id: EntityId) -> CoreResult<()> {
        for agent_id in affected {
            if !self.hub.has_session(agent_id) {
                continue;
            }

            let rules = self.applicable_rules_for(agent_id).await?;
            let mut updated = Vec::new();
            for rule in &rules {
                if Self::transits_peer(rule, agent_id, peer_id) {
                    updated.push(self.converter.convert(rule, agent_id).await?);
                }
            }
            if updated.is_empty() {
                continue;
            }
            let agent = self.agents.get(agent_id).await?;
            let version = self.global_version.next();
            self.send_envelope(
                agent_id,
                &agent.sid,
                ConfigSyncPayload {
                    version,
                    full_sync: false,
                    added: Vec::new(),
                    updated,
                    removed: Vec::new(),
                    client_token: None,
                },
            );
        }
        Ok(())
    }

    /// `NotifyExitPortChange`: an exit agent's direct-mode listen port
    /// changed.
    pub async fn notify_exit_port_change(
        &self,
        affected_finder: &crate::affected::AffectedAgentsFinder,
        exit_id: EntityId,
    ) -> CoreResult<()> {
        let affected = affected_finder.find_by_agent_port_change(exit_id).await?;
        self.notify_peer_change(affected, exit_id).await
    }

    /// `NotifyAgentAddressChange`: an agent's public/tunnel address
    /// changed.
    pub async fn notify_agent_address_change(
        &self,
        affected_finder: &crate::affected::AffectedAgentsFinder,
        agent_id: EntityId,
    ) -> CoreResult<()> {
        let affected = affected_finder.find_by_agent_port_change(agent_id).await?;
        self.notify_peer_change(affected, agent_id).await
    }

    /// Handles an inbound `config_ack`: updates `agent_versions` per the
    /// ordering guarantee above. Failure acks are logged but never trigger
    /// a re-send — the next change or reconnect heals it (spec §4.4/§7).
    pub fn handle_config_ack(&self, agent_id: EntityId, version: u64, success: bool, error: Option<&str>) {
        self.agent_versions.record_ack(agent_id, version);
        if !success {
            warn!(agent_id, version, error = error.unwrap_or("unknown"), "agent reported failed config ack");
        }
    }
}

fn now_ts() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affected::AffectedAgentsFinder;
    use crate::cache::InMemoryAgentStatusCache;
    use crate::domain::AgentRecordStatus;
    use crate::repository::{InMemoryAgentRepository, InMemoryNodeRepository, InMemoryRuleRepository};
    use fabric_protocol::{IpVersion, Protocol, RuleStatus};
    use std::time::Duration;

    fn agent(id: EntityId, sid: &str) -> crate::domain::ForwardingAgent {
        crate::domain::ForwardingAgent {
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

    fn direct_rule(id: EntityId, sid: &str, agent_id: EntityId) -> ForwardingRule {
        ForwardingRule {
            id,
            sid: sid.to_string(),
            rule_type: RuleType::Direct,
            agent_id,
            exit_agent_id: None,
            chain_agent_ids: Vec::new(),
            chain_port_config: HashMap::new(),
            listen_port: 8080,
            target_address: "10.0.0.9".into(),
            target_port: 80,
            target_node_id: None,
            bind_ip: None,
            protocol: Protocol::Tcp,
            tunnel_type: fabric_protocol::TunnelType::Ws,
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

    async fn engine_with(
        agents: Vec<crate::domain::ForwardingAgent>,
        rules: Vec<ForwardingRule>,
    ) -> (Arc<AgentHub>, ConfigSyncEngine) {
        let agent_repo = Arc::new(InMemoryAgentRepository::new());
        for a in agents {
            agent_repo.upsert(a).await.unwrap();
        }
        let rule_repo = Arc::new(InMemoryRuleRepository::new());
        for r in rules {
            rule_repo.upsert(r).await.unwrap();
        }
        let converter = Arc::new(RuleToAgentConverter::new(
            agent_repo.clone(),
            Arc::new(InMemoryNodeRepository::new()),
            Arc::new(InMemoryAgentStatusCache::new()),
            Arc::new(TokenService::new(b"secret".to_vec(), Duration::from_secs(60))),
        ));
        let hub = AgentHub::new(4, Duration::from_secs(30), Duration::from_secs(60));
        let engine = ConfigSyncEngine::new(
            hub.clone(),
            rule_repo,
            agent_repo,
            converter,
            Arc::new(TokenService::new(b"secret".to_vec(), Duration::from_secs(60))),
            Arc::new(GlobalVersion::new()),
            Arc::new(AgentVersions::new()),
        );
        (hub, engine)
    }

    #[tokio::test]
    async fn full_sync_delivers_every_applicable_rule_and_bumps_version() {
        let (hub, engine) = engine_with(
            vec![agent(1, "fa_1")],
            vec![direct_rule(1, "fr_A", 1)],
        )
        .await;
        let mut session = hub.register(1, "fa_1".into()).await;

        engine.full_sync_to_agent(1).await.unwrap();

        let envelope = session.rx.try_recv().expect("full sync envelope queued");
        let payload: ConfigSyncPayload = envelope.decode().unwrap();
        assert!(payload.full_sync);
        assert_eq!(payload.added.len(), 1);
        assert!(payload.client_token.is_some());
        assert_eq!(engine.agent_versions.get(1), Some(payload.version));
    }

    #[tokio::test]
    async fn full_sync_is_a_no_op_when_agent_is_offline() {
        let (_hub, engine) = engine_with(vec![agent(1, "fa_1")], vec![direct_rule(1, "fr_A", 1)]).await;
        engine.full_sync_to_agent(1).await.unwrap();
        assert_eq!(engine.agent_versions.get(1), None);
    }

    #[test]
    fn ack_ordering_never_regresses_the_recorded_version() {
        let versions = AgentVersions::new();
        versions.record_ack(1, 5);
        versions.record_ack(1, 3);
        assert_eq!(versions.get(1), Some(5));
        versions.record_ack(1, 9);
        assert_eq!(versions.get(1), Some(9));
    }

    #[tokio::test]
    async fn exit_port_change_resends_only_the_affected_entry_rule() {
        let mut entry_rule = direct_rule(1, "fr_entry", 10);
        entry_rule.rule_type = RuleType::Entry;
        entry_rule.exit_agent_id = Some(20);

        let (hub, engine) = engine_with(
            vec![agent(10, "fa_entry"), agent(20, "fa_exit")],
            vec![entry_rule],
        )
        .await;
        let mut entry_session = hub.register(10, "fa_entry".into()).await;
        let finder = AffectedAgentsFinder::new(engine.rules.clone());

        engine.notify_exit_port_change(&finder, 20).await.unwrap();

        let envelope = entry_session.rx.try_recv().expect("update envelope queued");
        let payload: ConfigSyncPayload = envelope.decode().unwrap();
        assert_eq!(payload.updated.len(), 1);
        assert!(!payload.full_sync);
    }
}
