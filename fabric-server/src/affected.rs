//! # Affected-Agents Finder (spec §4.3)
//!
//! Given a rule, node, or agent-port mutation, returns the set of agents
//! whose projection is now stale. Every mutation API on the server calls
//! exactly one of these and feeds the result into the config sync engine
//! — this module never sends anything itself.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use fabric_protocol::RuleType;

use crate::domain::{EntityId, ForwardingRule};
use crate::error::CoreResult;
use crate::repository::RuleRepository;

pub struct AffectedAgentsFinder {
    rules: Arc<dyn RuleRepository>,
}

impl AffectedAgentsFinder {
    pub fn new(rules: Arc<dyn RuleRepository>) -> Self {
        Self { rules }
    }

    /// `FindByRuleChange`: owning agent plus, per type, exit agent(s) or
    /// every chain agent.
    pub fn find_by_rule_change(&self, rule: &ForwardingRule) -> HashSet<EntityId> {
        let mut affected = HashSet::new();
        affected.insert(rule.agent_id);
        match rule.rule_type {
            RuleType::Entry => {
                if let Some(exit) = rule.exit_agent_id {
                    affected.insert(exit);
                }
            }
            RuleType::Chain | RuleType::DirectChain => {
                affected.extend(rule.chain_agent_ids.iter().copied());
            }
            RuleType::Direct | RuleType::External => {}
        }
        affected
    }

    /// `FindByNodeChange`: enumerate enabled rules targeting `node`, mapped
    /// to the agent that physically connects to the target — for `direct`
    /// that's the entry agent; for `entry` the exit agent; for
    /// `chain`/`direct_chain` the last chain agent.
    pub async fn find_by_node_change(
        &self,
        node: EntityId,
    ) -> CoreResult<HashMap<EntityId, Vec<ForwardingRule>>> {
        let rules = self.rules.enabled_targeting_node(node).await?;
        let mut by_agent: HashMap<EntityId, Vec<ForwardingRule>> = HashMap::new();
        for rule in rules {
            let connecting_agent = match rule.rule_type {
                RuleType::Direct | RuleType::External => rule.agent_id,
                RuleType::Entry => match rule.exit_agent_id {
                    Some(exit) => exit,
                    None => continue,
                },
                RuleType::Chain | RuleType::DirectChain => {
                    *rule.full_chain().last().expect("full_chain is never empty")
                }
            };
            by_agent.entry(connecting_agent).or_default().push(rule);
        }
        Ok(by_agent)
    }

    /// `FindByAgentPortChange`: entry agents of `entry` rules whose exit is
    /// `exit_id`, plus any chain participant whose next hop in the full
    /// chain equals `exit_id`.
    pub async fn find_by_agent_port_change(&self, exit_id: EntityId) -> CoreResult<HashSet<EntityId>> {
        let mut affected = HashSet::new();

        for rule in self.rules.exited_by(exit_id).await? {
            affected.insert(rule.agent_id);
        }

        for rule in self.rules.chain_participant(exit_id).await? {
            let chain = rule.full_chain();
            if let Some(pos) = chain.iter().position(|id| *id == exit_id) {
                if pos > 0 {
                    affected.insert(chain[pos - 1]);
                }
            }
        }
        // An owning agent whose very next hop is exit_id (position 0 ->
        // position 1) is also covered by `chain_participant` returning
        // rules where exit_id is in chain_agent_ids; an owner is never in
        // its own chain_agent_ids (validated at write time), so this loop
        // alone covers every predecessor in the full chain.

        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryRuleRepository;
    use fabric_protocol::{IpVersion, Protocol, RuleStatus, TunnelType};
    use std::collections::HashMap as StdHashMap;

    fn base_rule(id: EntityId, sid: &str) -> ForwardingRule {
        ForwardingRule {
            id,
            sid: sid.to_string(),
            rule_type: RuleType::Direct,
            agent_id: 1,
            exit_agent_id: None,
            chain_agent_ids: Vec::new(),
            chain_port_config: StdHashMap::new(),
            listen_port: 1000,
            target_address: "10.0.0.1".into(),
            target_port: 80,
            target_node_id: Some(7),
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

    #[tokio::test]
    async fn node_change_maps_chain_rule_to_last_agent() {
        let repo = Arc::new(InMemoryRuleRepository::new());
        let mut rule = base_rule(3, "fr_C");
        rule.rule_type = RuleType::Chain;
        rule.chain_agent_ids = vec![2, 3];
        repo.upsert(rule.clone()).await.unwrap();

        let finder = AffectedAgentsFinder::new(repo);
        let affected = finder.find_by_node_change(7).await.unwrap();
        assert_eq!(affected.len(), 1);
        assert_eq!(affected.get(&3).unwrap()[0].sid, "fr_C");
    }

    #[tokio::test]
    async fn agent_port_change_affects_entry_and_chain_predecessors() {
        let repo = Arc::new(InMemoryRuleRepository::new());
        let mut entry_rule = base_rule(1, "fr_entry");
        entry_rule.rule_type = RuleType::Entry;
        entry_rule.agent_id = 10;
        entry_rule.exit_agent_id = Some(20);
        repo.upsert(entry_rule).await.unwrap();

        let mut chain_rule = base_rule(2, "fr_chain");
        chain_rule.rule_type = RuleType::Chain;
        chain_rule.agent_id = 1;
        chain_rule.chain_agent_ids = vec![20, 30];
        repo.upsert(chain_rule).await.unwrap();

        let finder = AffectedAgentsFinder::new(repo);
        let affected = finder.find_by_agent_port_change(20).await.unwrap();
        assert!(affected.contains(&10));
        assert!(affected.contains(&1));
    }
}
