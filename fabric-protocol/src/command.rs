//! `command` payload (server → agent): one-shot directives outside the
//! regular config-sync flow.

use serde::{Deserialize, Serialize};

/// The set of actions a `command` envelope may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandAction {
    ReloadConfig,
    RestartRule,
    StopRule,
    Probe,
    Update,
    ApiUrlChanged,
    ConfigRelocate,
}

/// `command` payload. `data` carries action-specific fields (e.g. `new_url`
/// and `reason` for `api_url_changed`) as an opaque JSON object so this
/// type does not need a variant per action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandPayload {
    pub action: CommandAction,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl CommandPayload {
    pub fn api_url_changed(new_url: &str, reason: &str) -> Self {
        Self {
            action: CommandAction::ApiUrlChanged,
            data: serde_json::json!({ "new_url": new_url, "reason": reason }),
        }
    }
}
