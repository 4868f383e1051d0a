//! # REST API Endpoints
//!
//! A thin surface that exercises the core control-plane components over
//! HTTP: listing online agents, requesting an ad hoc rule probe, reporting
//! traffic outside the hub channel, and broadcasting an API URL change. The
//! spec treats rule/agent CRUD and the operator-facing dashboard as an
//! external collaborator (§1); these handlers cover only the operations the
//! core components themselves expose, the same scope the teacher's
//! `list_agents` endpoint had for its (much smaller) agent registry.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::state::AppState;

pub struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            CoreError::ValidationFailed(_) => StatusCode::BAD_REQUEST,
            CoreError::Unauthorized => StatusCode::UNAUTHORIZED,
            CoreError::Forbidden => StatusCode::FORBIDDEN,
            CoreError::AgentNotConnected => StatusCode::CONFLICT,
            CoreError::SendChannelFull => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::ProbeTimeout => StatusCode::GATEWAY_TIMEOUT,
            CoreError::ProbeFailed(_) => StatusCode::BAD_GATEWAY,
            CoreError::InvalidIpVersion => StatusCode::BAD_REQUEST,
            CoreError::Conflict(_) => StatusCode::CONFLICT,
            CoreError::TransientCacheFailure(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::PersistentStoreFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.0.to_string()).into_response()
    }
}

/// Response item representing a single connected agent.
#[derive(Serialize)]
pub struct AgentListItem {
    pub agent_sid: String,
    pub online: bool,
}

/// `GET /api/agents` — every agent with a live hub session, annotated with
/// whether it also passes the freshness half of "online".
pub async fn list_agents(State(state): State<AppState>) -> Json<Vec<AgentListItem>> {
    let mut items = Vec::new();
    for agent_id in state.hub.online_agent_ids() {
        if let Ok(agent) = state.agents.get(agent_id).await {
            let online = state.is_agent_online(agent_id).await;
            items.push(AgentListItem {
                agent_sid: agent.sid,
                online,
            });
        }
    }
    Json(items)
}

#[derive(Serialize)]
pub struct AgentOnlineStatus {
    pub online: bool,
}

/// `GET /api/agents/{sid}/online` — `IsAgentOnline` (§3, §9) for a single
/// agent, resolved through the directory the same way a connecting agent's
/// SID is.
pub async fn agent_online(
    State(state): State<AppState>,
    Path(sid): Path<String>,
) -> Json<AgentOnlineStatus> {
    let agent_id = state.directory.id_for(&sid);
    Json(AgentOnlineStatus {
        online: state.is_agent_online(agent_id).await,
    })
}

/// `GET /healthz` — liveness probe for the process itself, independent of
/// any agent's connection state.
pub async fn healthz() -> StatusCode {
    StatusCode::OK
}

#[derive(Debug, Deserialize)]
pub struct ProbeQuery {
    pub ip_version: Option<fabric_protocol::IpVersion>,
}

/// `POST /api/rules/{sid}/probe` — ad hoc `ProbeRule` (§4.5), independent
/// of the periodic/on-change sync paths.
pub async fn probe_rule(
    State(state): State<AppState>,
    Path(sid): Path<String>,
    Query(query): Query<ProbeQuery>,
) -> Result<Json<crate::probe::RuleProbeResponse>, ApiError> {
    let response = state.probes.probe_rule(&sid, query.ip_version).await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct TrafficReportBody {
    pub rule_id: String,
    pub upload: u64,
    pub download: u64,
}

/// `POST /api/traffic` — an out-of-band traffic report, for deployments
/// that track usage outside the hub's `traffic` message (§4.6).
pub async fn report_traffic(
    State(state): State<AppState>,
    Json(body): Json<TrafficReportBody>,
) -> Result<StatusCode, ApiError> {
    let rule = state.rules.get_by_sid(&body.rule_id).await?;
    state.traffic.add_traffic(rule.id, body.upload, body.download).await;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
pub struct BroadcastApiUrlBody {
    pub new_url: String,
    pub reason: String,
}

#[derive(Serialize)]
pub struct BroadcastResult {
    pub agents_notified: usize,
    pub agents_online: usize,
}

/// `POST /api/broadcast/api-url` — `BroadcastAPIURLChanged` (§4.1), fanned
/// out to every currently connected agent.
pub async fn broadcast_api_url_changed(
    State(state): State<AppState>,
    Json(body): Json<BroadcastApiUrlBody>,
) -> Json<BroadcastResult> {
    let (agents_notified, agents_online) = state
        .hub
        .broadcast_api_url_changed(&body.new_url, &body.reason);
    Json(BroadcastResult {
        agents_notified,
        agents_online,
    })
}
