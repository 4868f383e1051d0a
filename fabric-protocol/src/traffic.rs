//! `traffic` payload (agent → server), reported either over the hub
//! channel or via the REST surface, and funneled into the traffic buffer.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TrafficReportPayload {
    pub rule_id: String,
    pub upload: u64,
    pub download: u64,
}
