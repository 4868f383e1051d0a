//! # Server State
//!
//! Wires every control-plane component from §2's component graph into one
//! `AppState`: the agent hub, the rule-to-agent converter, the affected-
//! agents finder, the config sync engine, the probe orchestrator, the
//! traffic buffer, and the limit enforcer, plus the repository and cache
//! seams they all read through. Built once at startup and cloned — cheap,
//! since every field is an `Arc` or a plain `ServerConfig` — into every
//! axum handler, the same role the original `AppState` agent registry
//! played for its much smaller set of `DashMap`s.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use fabric_protocol::Protocol;

use crate::affected::AffectedAgentsFinder;
use crate::cache::{AgentStatusCache, InMemoryAgentStatusCache, InMemoryTrafficCache};
use crate::config::ServerConfig;
use crate::converter::RuleToAgentConverter;
use crate::domain::{AgentRecordStatus, EntityId, ForwardingAgent};
use crate::hub::AgentHub;
use crate::limits::LimitEnforcer;
use crate::probe::ProbeOrchestrator;
use crate::repository::{
    AgentRepository, InMemoryAgentRepository, InMemoryNodeRepository, InMemoryRuleRepository,
    InMemorySubscriptionRepository, InMemoryUsageStatsRepository, RuleRepository,
};
use crate::sync::{AgentVersions, ConfigSyncEngine, GlobalVersion};
use crate::token::TokenService;
use crate::traffic::TrafficBuffer;

/// Maps an agent's wire SID to the numeric `EntityId` every core component
/// operates on (§3: internal numeric ids never cross the wire). A SID seen
/// for the first time is allocated the next id; this is the only place in
/// the crate that mints a fresh `EntityId` outside of a repository.
pub struct AgentDirectory {
    by_sid: DashMap<String, EntityId>,
    next_id: AtomicU64,
}

impl AgentDirectory {
    fn new() -> Self {
        Self {
            by_sid: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Returns the id for `sid`, minting one on first sight.
    pub fn id_for(&self, sid: &str) -> EntityId {
        if let Some(id) = self.by_sid.get(sid) {
            return *id;
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.by_sid.insert(sid.to_string(), id);
        id
    }
}

/// Shared application state, cloned into every request/connection handler.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub hub: Arc<AgentHub>,
    pub directory: Arc<AgentDirectory>,
    pub rules: Arc<dyn RuleRepository>,
    pub agents: Arc<dyn AgentRepository>,
    pub nodes: Arc<InMemoryNodeRepository>,
    pub subscriptions: Arc<InMemorySubscriptionRepository>,
    pub usage_stats: Arc<InMemoryUsageStatsRepository>,
    pub traffic_cache: Arc<InMemoryTrafficCache>,
    pub status_cache: Arc<dyn AgentStatusCache>,
    pub tokens: Arc<TokenService>,
    pub converter: Arc<RuleToAgentConverter>,
    pub affected: Arc<AffectedAgentsFinder>,
    pub sync: Arc<ConfigSyncEngine>,
    pub probes: Arc<ProbeOrchestrator>,
    pub traffic: Arc<TrafficBuffer>,
    pub limits: Arc<LimitEnforcer>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        let hub = AgentHub::new(config.send_queue_depth, config.ping_period, config.pong_wait);
        let directory = Arc::new(AgentDirectory::new());

        let rules: Arc<dyn RuleRepository> = Arc::new(InMemoryRuleRepository::new());
        let agents: Arc<dyn AgentRepository> = Arc::new(InMemoryAgentRepository::new());
        let nodes = Arc::new(InMemoryNodeRepository::new());
        let subscriptions = Arc::new(InMemorySubscriptionRepository::new());
        let usage_stats = Arc::new(InMemoryUsageStatsRepository::new());
        let traffic_cache = Arc::new(InMemoryTrafficCache::new());
        let status_cache: Arc<dyn AgentStatusCache> = Arc::new(InMemoryAgentStatusCache::new());
        let tokens = Arc::new(TokenService::new(config.token_secret.clone(), config.token_ttl));

        let converter = Arc::new(RuleToAgentConverter::new(
            agents.clone(),
            nodes.clone(),
            status_cache.clone(),
            tokens.clone(),
        ));
        let affected = Arc::new(AffectedAgentsFinder::new(rules.clone()));
        let sync = Arc::new(ConfigSyncEngine::new(
            hub.clone(),
            rules.clone(),
            agents.clone(),
            converter.clone(),
            tokens.clone(),
            Arc::new(GlobalVersion::new()),
            Arc::new(AgentVersions::new()),
        ));
        let probes = Arc::new(ProbeOrchestrator::new(
            hub.clone(),
            rules.clone(),
            agents.clone(),
            nodes.clone(),
            status_cache.clone(),
            tokens.clone(),
            config.probe_timeout,
            config.probe_ping_extension,
            config.default_ping_count,
            config.default_ping_interval,
        ));
        let limits = Arc::new(LimitEnforcer::new(
            rules.clone(),
            subscriptions.clone(),
            usage_stats.clone(),
            traffic_cache.clone(),
        ));
        let traffic = TrafficBuffer::new(
            traffic_cache.clone(),
            Some(limits.clone()),
            config.flush_interval,
            config.flush_batch_cap,
            config.flush_max_retry,
        );

        Self {
            config,
            hub,
            directory,
            rules,
            agents,
            nodes,
            subscriptions,
            usage_stats,
            traffic_cache,
            status_cache,
            tokens,
            converter,
            affected,
            sync,
            probes,
            traffic,
            limits,
        }
    }

    /// `IsAgentOnline` (§3, resolved open question in §9): both a live hub
    /// session and a recently reported `last_seen_at` must hold. A hub
    /// session with no matching repository record (not yet provisioned)
    /// is never online.
    pub async fn is_agent_online(&self, agent_id: EntityId) -> bool {
        if !self.hub.has_session(agent_id) {
            return false;
        }
        match self.agents.get(agent_id).await {
            Ok(agent) => {
                agent.is_recently_seen(now_ts(), self.config.staleness_window.as_secs() as i64)
            }
            Err(_) => false,
        }
    }

    /// Ensures a repository record exists for a connecting agent, seeding a
    /// placeholder on first-ever connection. Real agent provisioning
    /// (public address, token hash, allowed ports, …) is an external
    /// collaborator's job (§1); this only guarantees the converter and
    /// sync engine have something to read.
    pub async fn ensure_agent_record(&self, agent_id: EntityId, sid: &str) {
        if self.agents.get(agent_id).await.is_ok() {
            let _ = self.agents.touch_last_seen(agent_id, now_ts()).await;
            return;
        }
        let _ = self
            .agents
            .upsert(ForwardingAgent {
                id: agent_id,
                sid: sid.to_string(),
                public_address: String::new(),
                tunnel_address: None,
                token_hash: String::new(),
                status: AgentRecordStatus::Active,
                platform: String::new(),
                arch: String::new(),
                agent_version: String::new(),
                allowed_port_range: None,
                blocked_protocols: Vec::<Protocol>::new(),
                last_seen_at: now_ts(),
                group_ids: Vec::new(),
            })
            .await;
    }
}

pub fn now_ts() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs() as i64
}
