//! Prefixed, human-readable external identifiers ("SIDs").
//!
//! Internal numeric IDs never cross the wire; every envelope, rule view and
//! command references the prefixed form instead (`fr_…`, `fa_…`, `node_…`,
//! `rg_…`). Keeping the prefix baked into the generator means a SID found in
//! a log line is self-describing.

use uuid::Uuid;

/// Forwarding rule SID prefix.
pub const RULE_PREFIX: &str = "fr";
/// Forwarding agent SID prefix.
pub const AGENT_PREFIX: &str = "fa";
/// Node SID prefix.
pub const NODE_PREFIX: &str = "node";
/// Resource group SID prefix.
pub const GROUP_PREFIX: &str = "rg";

/// Generates a new SID of the form `{prefix}_{16 hex chars}`.
pub fn generate_sid(prefix: &str) -> String {
    let raw = Uuid::new_v4().simple().to_string();
    format!("{prefix}_{}", &raw[..16])
}

/// Shorthand for a fresh rule SID.
pub fn new_rule_sid() -> String {
    generate_sid(RULE_PREFIX)
}

/// Shorthand for a fresh agent SID.
pub fn new_agent_sid() -> String {
    generate_sid(AGENT_PREFIX)
}

/// Shorthand for a fresh node SID.
pub fn new_node_sid() -> String {
    generate_sid(NODE_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_sids_carry_their_prefix() {
        assert!(new_rule_sid().starts_with("fr_"));
        assert!(new_agent_sid().starts_with("fa_"));
        assert!(new_node_sid().starts_with("node_"));
    }

    #[test]
    fn generated_sids_are_unique() {
        assert_ne!(new_agent_sid(), new_agent_sid());
    }
}
