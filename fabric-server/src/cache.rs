//! The cache boundary (§3, §4.6, §4.7): hot per-rule traffic counters the
//! traffic buffer flushes into, and the cached `AgentStatus` the converter
//! and probe orchestrator read WS/TLS ports from. Both are external,
//! TTL-bounded stores in the spec; the in-memory implementations here are
//! process-lifetime stand-ins with no TTL eviction, adequate for tests and
//! for a single-process deployment.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use fabric_protocol::AgentStatusReport;

use crate::domain::EntityId;
use crate::error::CoreResult;

/// A single flushed traffic delta, as submitted by the traffic buffer.
#[derive(Debug, Clone, Copy)]
pub struct TrafficDelta {
    pub rule_id: EntityId,
    pub upload: u64,
    pub download: u64,
}

#[async_trait]
pub trait TrafficCache: Send + Sync {
    /// Pipelined batch increment; either the whole batch is applied or the
    /// call fails (the traffic buffer treats a partial application the
    /// same as a full failure and retries the whole batch).
    async fn batch_increment(&self, entries: &[TrafficDelta]) -> CoreResult<()>;

    /// Hot usage (yesterday 00:00 UTC → now) for `user`, in bytes.
    async fn hot_usage_bytes(&self, user: EntityId, since_epoch: i64) -> CoreResult<u64>;
}

#[async_trait]
pub trait AgentStatusCache: Send + Sync {
    async fn get(&self, agent_id: EntityId) -> Option<AgentStatusReport>;
    async fn set(&self, agent_id: EntityId, status: AgentStatusReport);
}

#[derive(Default)]
pub struct InMemoryTrafficCache {
    /// Lifetime bytes per rule, the running total `hot_usage_bytes`
    /// attributes to the rule's owning user via the caller-supplied
    /// `user_of_rule` lookup at query time in tests; production use would
    /// key directly by user in the real cache schema.
    per_rule: RwLock<HashMap<EntityId, (u64, u64)>>,
    per_user: RwLock<HashMap<EntityId, u64>>,
}

impl InMemoryTrafficCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule_totals(&self, rule_id: EntityId) -> (u64, u64) {
        self.per_rule
            .read()
            .expect("traffic cache lock poisoned")
            .get(&rule_id)
            .copied()
            .unwrap_or((0, 0))
    }

    /// Test/setup helper: attribute `bytes` of hot usage to `user`,
    /// standing in for whatever rule→user join a real cache schema would
    /// perform.
    pub fn set_user_hot_usage(&self, user: EntityId, bytes: u64) {
        self.per_user
            .write()
            .expect("traffic cache lock poisoned")
            .insert(user, bytes);
    }

    pub fn add_user_hot_usage(&self, user: EntityId, bytes: u64) {
        let mut guard = self.per_user.write().expect("traffic cache lock poisoned");
        *guard.entry(user).or_insert(0) += bytes;
    }
}

#[async_trait]
impl TrafficCache for InMemoryTrafficCache {
    async fn batch_increment(&self, entries: &[TrafficDelta]) -> CoreResult<()> {
        let mut guard = self.per_rule.write().expect("traffic cache lock poisoned");
        for entry in entries {
            let slot = guard.entry(entry.rule_id).or_insert((0, 0));
            slot.0 += entry.upload;
            slot.1 += entry.download;
        }
        Ok(())
    }

    async fn hot_usage_bytes(&self, user: EntityId, _since_epoch: i64) -> CoreResult<u64> {
        Ok(self
            .per_user
            .read()
            .expect("traffic cache lock poisoned")
            .get(&user)
            .copied()
            .unwrap_or(0))
    }
}

#[derive(Default)]
pub struct InMemoryAgentStatusCache {
    statuses: RwLock<HashMap<EntityId, AgentStatusReport>>,
}

impl InMemoryAgentStatusCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AgentStatusCache for InMemoryAgentStatusCache {
    async fn get(&self, agent_id: EntityId) -> Option<AgentStatusReport> {
        self.statuses
            .read()
            .expect("status cache lock poisoned")
            .get(&agent_id)
            .cloned()
    }

    async fn set(&self, agent_id: EntityId, status: AgentStatusReport) {
        self.statuses
            .write()
            .expect("status cache lock poisoned")
            .insert(agent_id, status);
    }
}
