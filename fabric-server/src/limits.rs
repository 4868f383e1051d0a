//! # Traffic-Limit Enforcer (spec §4.7)
//!
//! Fired after every successful traffic batch flush and callable ad hoc
//! per user. A lambda-architecture split (hot cache + cold daily stats)
//! lets the stats table lag the cache by up to a day without double
//! counting.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, NaiveTime, Utc};
use tracing::{error, warn};

use crate::cache::TrafficCache;
use crate::domain::EntityId;
use crate::repository::{RuleRepository, SubscriptionRepository, UsageStatsRepository};

const FORWARD_PLAN_TYPE: &str = "forward";
const ENFORCEMENT_PAGE_SIZE: usize = 100;

pub struct LimitEnforcer {
    rules: Arc<dyn RuleRepository>,
    subscriptions: Arc<dyn SubscriptionRepository>,
    usage_stats: Arc<dyn UsageStatsRepository>,
    traffic_cache: Arc<dyn TrafficCache>,
}

impl LimitEnforcer {
    pub fn new(
        rules: Arc<dyn RuleRepository>,
        subscriptions: Arc<dyn SubscriptionRepository>,
        usage_stats: Arc<dyn UsageStatsRepository>,
        traffic_cache: Arc<dyn TrafficCache>,
    ) -> Self {
        Self {
            rules,
            subscriptions,
            usage_stats,
            traffic_cache,
        }
    }

    /// `OnTrafficUpdate`: looks up the rule's owning user and re-evaluates
    /// their limit. A missing or userless rule is not an enforcement
    /// target and is silently ignored.
    pub async fn on_traffic_update(&self, rule_id: EntityId, _delta_up: u64, _delta_down: u64) {
        let rule = match self.rules.get(rule_id).await {
            Ok(rule) => rule,
            Err(e) => {
                warn!(rule_id, error = %e, "limit enforcer could not load rule for traffic update");
                return;
            }
        };
        let Some(user_id) = rule.user_id else {
            return;
        };
        self.enforce_for_user(user_id).await;
    }

    /// Callable ad hoc, outside the traffic-update trigger path.
    pub async fn enforce_for_user(&self, user_id: EntityId) {
        let subscriptions = match self.subscriptions.active_for_user(user_id).await {
            Ok(subs) => subs,
            Err(e) => {
                warn!(user_id, error = %e, "failed to load subscriptions for limit enforcement");
                return;
            }
        };
        let forward_plans: Vec<_> = subscriptions
            .into_iter()
            .filter(|s| s.plan_type == FORWARD_PLAN_TYPE)
            .collect();
        if forward_plans.is_empty() {
            return;
        }
        if forward_plans.iter().any(|s| s.traffic_limit.is_none()) {
            return; // at least one plan is unlimited
        }
        let ceiling = forward_plans
            .iter()
            .filter_map(|s| s.traffic_limit)
            .max()
            .expect("non-empty, all Some, checked above");

        let usage = match self.combined_usage(user_id).await {
            Ok(usage) => usage,
            Err(e) => {
                error!(user_id, error = %e, "failed to compute combined usage, skipping enforcement");
                return;
            }
        };
        if usage <= ceiling {
            return;
        }

        self.disable_user_rules(user_id).await;
    }

    /// Yesterday 00:00 UTC, as a day-start epoch boundary: hot portion
    /// from the traffic cache, cold portion (everything strictly before
    /// that boundary) from historical stats. Either source failing alone
    /// falls back to the other; both failing is an error.
    async fn combined_usage(&self, user_id: EntityId) -> Result<u64, String> {
        let day_start = Utc::now().date_naive().and_time(NaiveTime::MIN) - ChronoDuration::days(1);
        let since_epoch = day_start.and_utc().timestamp();

        let hot = self.traffic_cache.hot_usage_bytes(user_id, since_epoch).await;
        let cold = self.usage_stats.cold_usage_bytes(user_id, since_epoch).await;

        match (hot, cold) {
            (Ok(h), Ok(c)) => Ok(h + c),
            (Ok(h), Err(e)) => {
                warn!(user_id, error = %e, "cold usage lookup failed, falling back to hot only");
                Ok(h)
            }
            (Err(e), Ok(c)) => {
                warn!(user_id, error = %e, "hot usage lookup failed, falling back to cold only");
                Ok(c)
            }
            (Err(hot_err), Err(cold_err)) => Err(format!("hot: {hot_err}; cold: {cold_err}")),
        }
    }

    /// Pages through the user's enabled rules and disables each,
    /// persisting through the repository. Disabling a rule drops it out of
    /// the "enabled" filter `enabled_for_user_page` itself queries against,
    /// so the full snapshot is collected *before* any rule is disabled —
    /// otherwise advancing `offset` while the underlying enabled set
    /// shrinks by a page each iteration would skip rules. A single rule's
    /// failure to persist is logged and skipped; the walk continues.
    async fn disable_user_rules(&self, user_id: EntityId) {
        let mut snapshot = Vec::new();
        let mut offset = 0;
        loop {
            let page = match self
                .rules
                .enabled_for_user_page(user_id, offset, ENFORCEMENT_PAGE_SIZE)
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    error!(user_id, offset, error = %e, "failed to page enabled rules for enforcement");
                    return;
                }
            };
            if page.is_empty() {
                break;
            }
            let page_len = page.len();
            snapshot.extend(page);
            if page_len < ENFORCEMENT_PAGE_SIZE {
                break;
            }
            offset += ENFORCEMENT_PAGE_SIZE;
        }

        for mut rule in snapshot {
            rule.status = fabric_protocol::RuleStatus::Disabled;
            if let Err(e) = self.rules.upsert(rule.clone()).await {
                error!(rule = %rule.sid, error = %e, "failed to disable rule over traffic limit");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryTrafficCache;
    use crate::domain::ForwardingRule;
    use crate::repository::{
        InMemoryRuleRepository, InMemorySubscriptionRepository, InMemoryUsageStatsRepository, Subscription,
    };
    use fabric_protocol::{IpVersion, Protocol, RuleStatus, RuleType, TunnelType};
    use std::collections::HashMap;

    fn rule_for_user(id: EntityId, sid: &str, user_id: EntityId) -> ForwardingRule {
        ForwardingRule {
            id,
            sid: sid.to_string(),
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
            user_id: Some(user_id),
            subscription_id: None,
        }
    }

    async fn enforcer_with(
        rules: Vec<ForwardingRule>,
        subs: Vec<Subscription>,
        hot_bytes: u64,
        cold_bytes: u64,
    ) -> (Arc<InMemoryRuleRepository>, LimitEnforcer) {
        let rule_repo = Arc::new(InMemoryRuleRepository::new());
        for r in rules {
            rule_repo.upsert(r).await.unwrap();
        }
        let sub_repo = Arc::new(InMemorySubscriptionRepository::new());
        if let Some(first) = subs.first() {
            sub_repo.set_for_user(first.user_id, subs.clone());
        }
        let usage_repo = Arc::new(InMemoryUsageStatsRepository::new());
        if let Some(first) = subs.first() {
            usage_repo.set_cold_usage(first.user_id, cold_bytes);
        }
        let traffic_cache = Arc::new(InMemoryTrafficCache::new());
        if let Some(first) = subs.first() {
            traffic_cache.set_user_hot_usage(first.user_id, hot_bytes);
        }
        let enforcer = LimitEnforcer::new(rule_repo.clone(), sub_repo, usage_repo, traffic_cache);
        (rule_repo, enforcer)
    }

    #[tokio::test]
    async fn unlimited_plan_skips_enforcement_entirely() {
        let (rule_repo, enforcer) = enforcer_with(
            vec![rule_for_user(1, "fr_A", 7)],
            vec![Subscription {
                id: 1,
                user_id: 7,
                plan_type: "forward".into(),
                traffic_limit: None,
            }],
            u64::MAX,
            0,
        )
        .await;
        enforcer.enforce_for_user(7).await;
        assert_eq!(rule_repo.get(1).await.unwrap().status, RuleStatus::Enabled);
    }

    #[tokio::test]
    async fn usage_under_ceiling_leaves_rules_enabled() {
        let (rule_repo, enforcer) = enforcer_with(
            vec![rule_for_user(1, "fr_A", 7)],
            vec![Subscription {
                id: 1,
                user_id: 7,
                plan_type: "forward".into(),
                traffic_limit: Some(1_000_000),
            }],
            100,
            100,
        )
        .await;
        enforcer.enforce_for_user(7).await;
        assert_eq!(rule_repo.get(1).await.unwrap().status, RuleStatus::Enabled);
    }

    #[tokio::test]
    async fn usage_over_ceiling_disables_every_enabled_rule() {
        let (rule_repo, enforcer) = enforcer_with(
            vec![rule_for_user(1, "fr_A", 7), rule_for_user(2, "fr_B", 7)],
            vec![Subscription {
                id: 1,
                user_id: 7,
                plan_type: "forward".into(),
                traffic_limit: Some(100),
            }],
            200,
            0,
        )
        .await;
        enforcer.enforce_for_user(7).await;
        assert_eq!(rule_repo.get(1).await.unwrap().status, RuleStatus::Disabled);
        assert_eq!(rule_repo.get(2).await.unwrap().status, RuleStatus::Disabled);
    }

    #[tokio::test]
    async fn usage_over_ceiling_disables_every_rule_across_multiple_pages() {
        // 250 enabled rules: 2.5x the enforcement page size, enough that a
        // pagination bug (advancing `offset` while the enabled set shrinks
        // by a page each time disabling happens) would skip the middle page.
        let rules: Vec<_> = (1..=250)
            .map(|id| rule_for_user(id, &format!("fr_{id}"), 7))
            .collect();
        let (rule_repo, enforcer) = enforcer_with(
            rules,
            vec![Subscription {
                id: 1,
                user_id: 7,
                plan_type: "forward".into(),
                traffic_limit: Some(100),
            }],
            200,
            0,
        )
        .await;
        enforcer.enforce_for_user(7).await;
        for id in 1..=250 {
            assert_eq!(
                rule_repo.get(id).await.unwrap().status,
                RuleStatus::Disabled,
                "rule {id} was not disabled"
            );
        }
    }

    #[tokio::test]
    async fn non_forward_plans_are_ignored() {
        let (rule_repo, enforcer) = enforcer_with(
            vec![rule_for_user(1, "fr_A", 7)],
            vec![Subscription {
                id: 1,
                user_id: 7,
                plan_type: "hosting".into(),
                traffic_limit: Some(1),
            }],
            1_000,
            0,
        )
        .await;
        enforcer.enforce_for_user(7).await;
        assert_eq!(rule_repo.get(1).await.unwrap().status, RuleStatus::Enabled);
    }
}
