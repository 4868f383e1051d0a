//! # WebSocket Handlers
//!
//! The single entry point every agent connects through, plus the glue that
//! wires the agent hub's built-in sink, lifecycle hook, and pluggable
//! message handlers onto the rest of the control plane. Authentication of
//! the connecting agent (verifying its bearer token against a real identity
//! store) is an external collaborator's job per the component graph; this
//! module trusts the `agent_sid` query parameter the same way the teacher's
//! `ws_handler` trusted an unauthenticated upgrade, and is the one seam a
//! production deployment would put real auth middleware in front of.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use fabric_protocol::{agent_msg, AgentEvent, AgentStatusReport, Envelope};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::cache::AgentStatusCache;
use crate::hub::{AgentLifecycleHook, BuiltinMessageSink, MessageHandler, LIVENESS_PING_SENTINEL};
use crate::domain::EntityId;
use crate::probe::ProbeOrchestrator;
use crate::repository::AgentRepository;
use crate::state::{now_ts, AppState};
use crate::sync::ConfigSyncEngine;

#[derive(Debug, Deserialize)]
pub struct AgentConnectParams {
    pub agent_sid: String,
}

/// `GET /ws/agent?agent_sid=...` — upgrades the HTTP connection and hands
/// the caller's SID straight to [`handle_agent_connection`].
pub async fn ws_agent_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<AgentConnectParams>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_agent_connection(socket, state, params.agent_sid))
}

/// Drives one agent's physical connection for as long as it lives: resolves
/// its numeric id, registers it with the hub, spawns the writer loop, runs
/// the reader loop, and unregisters on exit. Modeled on the teacher's
/// `handle_connection`, generalized from an unbounded fan-out queue to the
/// hub's bounded per-agent session and from `WsMessage` relay frames to
/// `Envelope`s dispatched through `route_agent_message`.
async fn handle_agent_connection(socket: WebSocket, state: AppState, agent_sid: String) {
    let agent_id: EntityId = state.directory.id_for(&agent_sid);
    state.ensure_agent_record(agent_id, &agent_sid).await;

    let mut registered = state.hub.register(agent_id, agent_sid.clone()).await;
    let generation = registered.generation;
    info!(agent_id, agent_sid = %agent_sid, "agent connected");

    let (mut ws_sink, mut ws_stream) = socket.split();
    let write_wait = state.config.write_wait;

    let writer = tokio::spawn(async move {
        while let Some(envelope) = registered.rx.recv().await {
            let frame = if envelope.msg_type == LIVENESS_PING_SENTINEL {
                Message::Ping(Vec::new().into())
            } else {
                match serde_json::to_string(&envelope) {
                    Ok(text) => Message::Text(text.into()),
                    Err(e) => {
                        warn!(error = %e, "failed to encode outbound envelope, dropping");
                        continue;
                    }
                }
            };
            if timeout(write_wait, ws_sink.send(frame)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<Envelope>(&text) {
                Ok(envelope) => {
                    state
                        .hub
                        .route_agent_message(agent_id, &agent_sid, &envelope.msg_type, envelope.data)
                        .await;
                }
                Err(e) => warn!(agent_id, error = %e, "malformed envelope, dropping frame"),
            },
            Message::Pong(_) => state.hub.touch(agent_id),
            Message::Close(_) => break,
            _ => {}
        }
    }

    info!(agent_id, "agent disconnected");
    writer.abort();
    state.hub.unregister(agent_id, generation).await;
}

/// Handles the hub's three built-in message types: caches the agent's
/// latest status report, refreshes its freshness on a bare heartbeat, and
/// logs generic lifecycle events.
pub struct CoreMessageSink {
    pub agents: Arc<dyn AgentRepository>,
    pub status_cache: Arc<dyn AgentStatusCache>,
}

#[async_trait::async_trait]
impl BuiltinMessageSink for CoreMessageSink {
    async fn on_status(&self, agent_id: EntityId, report: AgentStatusReport) {
        self.status_cache.set(agent_id, report).await;
        if let Err(e) = self.agents.touch_last_seen(agent_id, now_ts()).await {
            warn!(agent_id, error = %e, "failed to record status heartbeat");
        }
    }

    async fn on_heartbeat(&self, agent_id: EntityId) {
        if let Err(e) = self.agents.touch_last_seen(agent_id, now_ts()).await {
            warn!(agent_id, error = %e, "failed to record heartbeat");
        }
    }

    async fn on_event(&self, agent_id: EntityId, event: AgentEvent) {
        info!(agent_id, kind = %event.kind, message = %event.message, "agent event");
    }
}

/// Pushes a full config sync the moment an agent comes online, matching
/// §4.4's `OnAgentOnline` hook.
pub struct SyncLifecycleHook {
    pub sync: Arc<ConfigSyncEngine>,
}

#[async_trait::async_trait]
impl AgentLifecycleHook for SyncLifecycleHook {
    async fn on_agent_online(&self, agent_id: EntityId) {
        if let Err(e) = self.sync.full_sync_to_agent(agent_id).await {
            warn!(agent_id, error = %e, "full sync on connect failed");
        }
    }

    async fn on_agent_offline(&self, agent_id: EntityId) {
        info!(agent_id, "agent session torn down");
    }
}

/// Correlates `probe_result` replies back to the orchestrator's pending
/// probe table.
pub struct ProbeResultHandler {
    pub probes: Arc<ProbeOrchestrator>,
}

#[async_trait::async_trait]
impl MessageHandler for ProbeResultHandler {
    async fn handle_message(&self, _agent_id: EntityId, _agent_sid: &str, msg_type: &str, data: &serde_json::Value) -> bool {
        if msg_type != agent_msg::PROBE_RESULT {
            return false;
        }
        match serde_json::from_value(data.clone()) {
            Ok(result) => {
                self.probes.handle_probe_result(result);
                true
            }
            Err(e) => {
                warn!(error = %e, "malformed probe_result payload, dropping");
                true
            }
        }
    }
}

/// Feeds `config_ack` replies back into the sync engine's per-agent version
/// ledger.
pub struct ConfigAckHandler {
    pub sync: Arc<ConfigSyncEngine>,
}

#[async_trait::async_trait]
impl MessageHandler for ConfigAckHandler {
    async fn handle_message(&self, agent_id: EntityId, _agent_sid: &str, msg_type: &str, data: &serde_json::Value) -> bool {
        if msg_type != agent_msg::CONFIG_ACK {
            return false;
        }
        match serde_json::from_value::<fabric_protocol::ConfigAck>(data.clone()) {
            Ok(ack) => {
                self.sync
                    .handle_config_ack(agent_id, ack.version, ack.success, ack.error.as_deref());
                true
            }
            Err(e) => {
                warn!(agent_id, error = %e, "malformed config_ack payload, dropping");
                true
            }
        }
    }
}

/// Logs `rule_sync_status` and `tunnel_health_report`; the spec treats both
/// as observability signal with no further control-plane reaction.
pub struct DiagnosticReportHandler;

#[async_trait::async_trait]
impl MessageHandler for DiagnosticReportHandler {
    async fn handle_message(&self, agent_id: EntityId, _agent_sid: &str, msg_type: &str, data: &serde_json::Value) -> bool {
        match msg_type {
            agent_msg::RULE_SYNC_STATUS => {
                match serde_json::from_value::<fabric_protocol::RuleSyncStatusPayload>(data.clone()) {
                    Ok(report) => {
                        info!(agent_id, rule = %report.rule_id, applied = report.applied, error = ?report.error, "rule sync status");
                    }
                    Err(e) => warn!(agent_id, error = %e, "malformed rule_sync_status payload"),
                }
                true
            }
            agent_msg::TUNNEL_HEALTH_REPORT => {
                match serde_json::from_value::<fabric_protocol::TunnelHealthReportPayload>(data.clone()) {
                    Ok(report) => {
                        info!(agent_id, rule = %report.rule_id, connected = report.connected, last_error = ?report.last_error, "tunnel health report");
                    }
                    Err(e) => warn!(agent_id, error = %e, "malformed tunnel_health_report payload"),
                }
                true
            }
            _ => false,
        }
    }
}

/// Resolves an inbound `traffic` report's rule SID to its numeric id and
/// folds the delta into the traffic buffer (§4.6). Holds only the two
/// collaborators it needs, not the whole `AppState` — `state.hub` owns this
/// handler, and `AppState` owns `state.hub`, so a clone of the full state
/// here would be a reference cycle that outlives every connection.
pub struct TrafficHandler {
    pub rules: Arc<dyn crate::repository::RuleRepository>,
    pub traffic: Arc<crate::traffic::TrafficBuffer>,
}

#[async_trait::async_trait]
impl MessageHandler for TrafficHandler {
    async fn handle_message(&self, agent_id: EntityId, _agent_sid: &str, msg_type: &str, data: &serde_json::Value) -> bool {
        if msg_type != agent_msg::TRAFFIC {
            return false;
        }
        let report = match serde_json::from_value::<fabric_protocol::TrafficReportPayload>(data.clone()) {
            Ok(report) => report,
            Err(e) => {
                warn!(agent_id, error = %e, "malformed traffic payload, dropping");
                return true;
            }
        };
        match self.rules.get_by_sid(&report.rule_id).await {
            Ok(rule) => {
                self.traffic
                    .add_traffic(rule.id, report.upload, report.download)
                    .await;
            }
            Err(e) => warn!(agent_id, rule = %report.rule_id, error = %e, "traffic report for unknown rule, dropping"),
        }
        true
    }
}

/// Installs the built-in sink, lifecycle hook, and every pluggable message
/// handler onto `state.hub`. Called once at startup before the server binds
/// its listener.
pub async fn install_hub_handlers(state: &AppState) {
    state
        .hub
        .set_builtin_sink(Arc::new(CoreMessageSink {
            agents: state.agents.clone(),
            status_cache: state.status_cache.clone(),
        }))
        .await;
    state
        .hub
        .register_lifecycle_hook(Arc::new(SyncLifecycleHook {
            sync: state.sync.clone(),
        }))
        .await;
    state
        .hub
        .register_message_handler(Arc::new(ProbeResultHandler {
            probes: state.probes.clone(),
        }))
        .await;
    state
        .hub
        .register_message_handler(Arc::new(ConfigAckHandler {
            sync: state.sync.clone(),
        }))
        .await;
    state
        .hub
        .register_message_handler(Arc::new(DiagnosticReportHandler))
        .await;
    state
        .hub
        .register_message_handler(Arc::new(TrafficHandler {
            rules: state.rules.clone(),
            traffic: state.traffic.clone(),
        }))
        .await;
}
