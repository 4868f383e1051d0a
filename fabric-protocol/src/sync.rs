//! `config_sync` payload and the agent's acknowledgment of it.

use crate::rule_view::RuleView;
use serde::{Deserialize, Serialize};

/// What kind of change a single `NotifyRuleChange` call represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Added,
    Updated,
    Removed,
}

/// `config_sync` payload (server → agent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSyncPayload {
    pub version: u64,
    pub full_sync: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub added: Vec<RuleView>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub updated: Vec<RuleView>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed: Vec<String>,
    /// Present only on full syncs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
}

/// `config_ack` payload (agent → server).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigAck {
    pub version: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
