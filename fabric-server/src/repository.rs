//! Repository traits: the storage seam the spec treats as an external
//! collaborator (§3, §4.9 "Repositories" in the component graph). Each
//! trait is `async_trait` so a real SQL-backed implementation can await a
//! connection pool; the in-memory implementations here exist so the crate
//! is runnable and testable without one, the same role the teacher's
//! `DashMap`-backed `AppState` plays for its (much smaller) connection
//! registry.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use fabric_protocol::RuleStatus;

use crate::domain::{EntityId, ForwardingAgent, ForwardingRule, Node};
use crate::error::{CoreError, CoreResult};

#[async_trait]
pub trait RuleRepository: Send + Sync {
    async fn get(&self, id: EntityId) -> CoreResult<ForwardingRule>;
    async fn get_by_sid(&self, sid: &str) -> CoreResult<ForwardingRule>;
    async fn upsert(&self, rule: ForwardingRule) -> CoreResult<()>;
    async fn delete(&self, id: EntityId) -> CoreResult<()>;

    /// Rules where `agent` is the owning/entry agent.
    async fn owned_by(&self, agent: EntityId) -> CoreResult<Vec<ForwardingRule>>;
    /// Rules where `agent` is the exit agent of an `entry` rule.
    async fn exited_by(&self, agent: EntityId) -> CoreResult<Vec<ForwardingRule>>;
    /// Rules where `agent` appears anywhere in `chain_agent_ids`.
    async fn chain_participant(&self, agent: EntityId) -> CoreResult<Vec<ForwardingRule>>;

    /// All enabled rules targeting `node`.
    async fn enabled_targeting_node(&self, node: EntityId) -> CoreResult<Vec<ForwardingRule>>;

    /// A page of a user's enabled rules, for the limit enforcer (§4.7).
    async fn enabled_for_user_page(
        &self,
        user: EntityId,
        offset: usize,
        limit: usize,
    ) -> CoreResult<Vec<ForwardingRule>>;
}

#[async_trait]
pub trait AgentRepository: Send + Sync {
    async fn get(&self, id: EntityId) -> CoreResult<ForwardingAgent>;
    async fn get_by_sid(&self, sid: &str) -> CoreResult<ForwardingAgent>;
    async fn upsert(&self, agent: ForwardingAgent) -> CoreResult<()>;
    async fn touch_last_seen(&self, id: EntityId, at: i64) -> CoreResult<()>;
}

#[async_trait]
pub trait NodeRepository: Send + Sync {
    async fn get(&self, id: EntityId) -> CoreResult<Node>;
}

/// One active subscription, as seen by the limit enforcer.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: EntityId,
    pub user_id: EntityId,
    pub plan_type: String,
    /// Bytes, or `None` for unlimited.
    pub traffic_limit: Option<u64>,
}

#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    async fn active_for_user(&self, user: EntityId) -> CoreResult<Vec<Subscription>>;
}

/// Daily-granularity historical usage, queried by the limit enforcer for
/// the "cold" portion of combined usage (§4.7).
#[async_trait]
pub trait UsageStatsRepository: Send + Sync {
    /// Total upload+download bytes for `user` strictly before
    /// `before_epoch_day_start` (seconds since epoch, truncated to a UTC
    /// day boundary).
    async fn cold_usage_bytes(&self, user: EntityId, before_epoch_day_start: i64) -> CoreResult<u64>;
}

// ── In-memory implementations ───────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryRuleRepository {
    rules: RwLock<HashMap<EntityId, ForwardingRule>>,
}

impl InMemoryRuleRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<EntityId, ForwardingRule>> {
        self.rules.read().expect("rule repository lock poisoned")
    }
}

#[async_trait]
impl RuleRepository for InMemoryRuleRepository {
    async fn get(&self, id: EntityId) -> CoreResult<ForwardingRule> {
        self.read()
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("rule", id.to_string()))
    }

    async fn get_by_sid(&self, sid: &str) -> CoreResult<ForwardingRule> {
        self.read()
            .values()
            .find(|r| r.sid == sid)
            .cloned()
            .ok_or_else(|| CoreError::not_found("rule", sid))
    }

    async fn upsert(&self, rule: ForwardingRule) -> CoreResult<()> {
        rule.validate()?;
        self.rules
            .write()
            .expect("rule repository lock poisoned")
            .insert(rule.id, rule);
        Ok(())
    }

    async fn delete(&self, id: EntityId) -> CoreResult<()> {
        self.rules
            .write()
            .expect("rule repository lock poisoned")
            .remove(&id);
        Ok(())
    }

    async fn owned_by(&self, agent: EntityId) -> CoreResult<Vec<ForwardingRule>> {
        Ok(self
            .read()
            .values()
            .filter(|r| r.agent_id == agent)
            .cloned()
            .collect())
    }

    async fn exited_by(&self, agent: EntityId) -> CoreResult<Vec<ForwardingRule>> {
        Ok(self
            .read()
            .values()
            .filter(|r| r.exit_agent_id == Some(agent))
            .cloned()
            .collect())
    }

    async fn chain_participant(&self, agent: EntityId) -> CoreResult<Vec<ForwardingRule>> {
        Ok(self
            .read()
            .values()
            .filter(|r| r.chain_agent_ids.contains(&agent))
            .cloned()
            .collect())
    }

    async fn enabled_targeting_node(&self, node: EntityId) -> CoreResult<Vec<ForwardingRule>> {
        Ok(self
            .read()
            .values()
            .filter(|r| r.status == RuleStatus::Enabled && r.target_node_id == Some(node))
            .cloned()
            .collect())
    }

    async fn enabled_for_user_page(
        &self,
        user: EntityId,
        offset: usize,
        limit: usize,
    ) -> CoreResult<Vec<ForwardingRule>> {
        let mut matching: Vec<ForwardingRule> = self
            .read()
            .values()
            .filter(|r| r.status == RuleStatus::Enabled && r.user_id == Some(user))
            .cloned()
            .collect();
        matching.sort_by_key(|r| r.id);
        Ok(matching.into_iter().skip(offset).take(limit).collect())
    }
}

#[derive(Default)]
pub struct InMemoryAgentRepository {
    agents: RwLock<HashMap<EntityId, ForwardingAgent>>,
}

impl InMemoryAgentRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AgentRepository for InMemoryAgentRepository {
    async fn get(&self, id: EntityId) -> CoreResult<ForwardingAgent> {
        self.agents
            .read()
            .expect("agent repository lock poisoned")
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("agent", id.to_string()))
    }

    async fn get_by_sid(&self, sid: &str) -> CoreResult<ForwardingAgent> {
        self.agents
            .read()
            .expect("agent repository lock poisoned")
            .values()
            .find(|a| a.sid == sid)
            .cloned()
            .ok_or_else(|| CoreError::not_found("agent", sid))
    }

    async fn upsert(&self, agent: ForwardingAgent) -> CoreResult<()> {
        self.agents
            .write()
            .expect("agent repository lock poisoned")
            .insert(agent.id, agent);
        Ok(())
    }

    async fn touch_last_seen(&self, id: EntityId, at: i64) -> CoreResult<()> {
        if let Some(agent) = self
            .agents
            .write()
            .expect("agent repository lock poisoned")
            .get_mut(&id)
        {
            agent.last_seen_at = at;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryNodeRepository {
    nodes: RwLock<HashMap<EntityId, Node>>,
}

impl InMemoryNodeRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, node: Node) {
        self.nodes
            .write()
            .expect("node repository lock poisoned")
            .insert(node.id, node);
    }
}

#[async_trait]
impl NodeRepository for InMemoryNodeRepository {
    async fn get(&self, id: EntityId) -> CoreResult<Node> {
        self.nodes
            .read()
            .expect("node repository lock poisoned")
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("node", id.to_string()))
    }
}

#[derive(Default)]
pub struct InMemorySubscriptionRepository {
    subscriptions: RwLock<HashMap<EntityId, Vec<Subscription>>>,
}

impl InMemorySubscriptionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_for_user(&self, user: EntityId, subs: Vec<Subscription>) {
        self.subscriptions
            .write()
            .expect("subscription repository lock poisoned")
            .insert(user, subs);
    }
}

#[async_trait]
impl SubscriptionRepository for InMemorySubscriptionRepository {
    async fn active_for_user(&self, user: EntityId) -> CoreResult<Vec<Subscription>> {
        Ok(self
            .subscriptions
            .read()
            .expect("subscription repository lock poisoned")
            .get(&user)
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Default)]
pub struct InMemoryUsageStatsRepository {
    cold_bytes: RwLock<HashMap<EntityId, u64>>,
}

impl InMemoryUsageStatsRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_cold_usage(&self, user: EntityId, bytes: u64) {
        self.cold_bytes
            .write()
            .expect("usage stats repository lock poisoned")
            .insert(user, bytes);
    }
}

#[async_trait]
impl UsageStatsRepository for InMemoryUsageStatsRepository {
    async fn cold_usage_bytes(&self, user: EntityId, _before_epoch_day_start: i64) -> CoreResult<u64> {
        Ok(self
            .cold_bytes
            .read()
            .expect("usage stats repository lock poisoned")
            .get(&user)
            .copied()
            .unwrap_or(0))
    }
}
