//! # Forwarding Fabric Protocol
//!
//! Wire types for the bidirectional channel between the fabric control
//! plane and its agents: the outer [`Envelope`], every typed payload that
//! can ride inside `data`, and the prefixed SID helpers used to name rules,
//! agents, nodes and groups on the wire.
//!
//! This crate is deliberately thin — payload structs and enums only, no
//! behavior — so both the server and an agent implementation can depend on
//! it without pulling in either side's runtime.

mod command;
mod envelope;
mod event;
pub mod ids;
mod probe;
mod rule_view;
mod status;
mod sync;
mod traffic;

pub use command::{CommandAction, CommandPayload};
pub use envelope::{agent_msg, server_msg, Envelope};
pub use event::{AgentEvent, RuleSyncStatusPayload, TunnelHealthReportPayload};
pub use probe::{ProbeResult, ProbeTask, ProbeTaskType};
pub use rule_view::{HopMode, IpVersion, Protocol, Role, RuleStatus, RuleType, RuleView, TunnelType};
pub use status::{AgentStatusReport, TunnelStatusEntry};
pub use sync::{ChangeType, ConfigAck, ConfigSyncPayload};
pub use traffic::TrafficReportPayload;
