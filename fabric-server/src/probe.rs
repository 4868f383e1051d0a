//! # Probe Orchestrator (spec §4.5)
//!
//! `probe_rule(sid, ip_version_override)` walks a rule's topology and
//! synthesizes a latency report by round-tripping `probe_task`/
//! `probe_result` envelopes through the hub. Every outgoing probe carries
//! a fresh `task_id`; a single-slot `tokio::sync::oneshot` channel keyed by
//! that id is the correlation mechanism, released the moment a reply
//! arrives or the timeout elapses.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use fabric_protocol::{server_msg, Envelope, IpVersion, Protocol, ProbeResult, ProbeTask, ProbeTaskType, RuleType};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::warn;
use uuid::Uuid;

use crate::cache::AgentStatusCache;
use crate::domain::{EntityId, ForwardingRule};
use crate::error::{CoreError, CoreResult};
use crate::hub::AgentHub;
use crate::repository::{AgentRepository, NodeRepository, RuleRepository};
use crate::token::TokenService;

fn protocol_str(p: Protocol) -> String {
    match p {
        Protocol::Tcp => "tcp",
        Protocol::Udp => "udp",
    }
    .to_string()
}

fn tunnel_type_str(t: fabric_protocol::TunnelType) -> String {
    match t {
        fabric_protocol::TunnelType::Ws => "ws",
        fabric_protocol::TunnelType::Tls => "tls",
    }
    .to_string()
}

/// One hop's outcome within a chain/direct-chain/entry probe.
#[derive(Debug, Clone, Serialize)]
pub struct HopProbeResult {
    pub agent_sid: String,
    pub success: bool,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

/// `ProbeRule`'s return value. Fields a given rule type leaves unused stay
/// `None`/empty rather than being zero-filled.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RuleProbeResponse {
    pub success: bool,
    pub target_latency_ms: Option<u64>,
    pub total_latency_ms: Option<u64>,
    pub tunnel_min_latency_ms: Option<u64>,
    pub tunnel_max_latency_ms: Option<u64>,
    pub tunnel_avg_latency_ms: Option<u64>,
    pub tunnel_packet_loss: Option<f32>,
    pub hops: Vec<HopProbeResult>,
    pub error: Option<String>,
}

#[derive(Default)]
struct PendingProbes(DashMap<String, oneshot::Sender<ProbeResult>>);

impl PendingProbes {
    fn register(&self, task_id: String) -> oneshot::Receiver<ProbeResult> {
        let (tx, rx) = oneshot::channel();
        self.0.insert(task_id, tx);
        rx
    }

    fn unregister(&self, task_id: &str) {
        self.0.remove(task_id);
    }

    /// Delivers a result to its waiter. A miss (unknown or already-expired
    /// `task_id`) is silent, matching the spec's late-reply discard rule.
    fn deliver(&self, task_id: &str, result: ProbeResult) {
        if let Some((_, tx)) = self.0.remove(task_id) {
            let _ = tx.send(result);
        }
    }
}

pub struct ProbeOrchestrator {
    hub: Arc<AgentHub>,
    rules: Arc<dyn RuleRepository>,
    agents: Arc<dyn AgentRepository>,
    nodes: Arc<dyn NodeRepository>,
    status_cache: Arc<dyn AgentStatusCache>,
    tokens: Arc<TokenService>,
    pending: PendingProbes,
    probe_timeout: Duration,
    ping_extension: Duration,
    default_ping_count: u32,
    default_ping_interval: Duration,
}

impl ProbeOrchestrator {
    pub fn new(
        hub: Arc<AgentHub>,
        rules: Arc<dyn RuleRepository>,
        agents: Arc<dyn AgentRepository>,
        nodes: Arc<dyn NodeRepository>,
        status_cache: Arc<dyn AgentStatusCache>,
        tokens: Arc<TokenService>,
        probe_timeout: Duration,
        ping_extension: Duration,
        default_ping_count: u32,
        default_ping_interval: Duration,
    ) -> Self {
        Self {
            hub,
            rules,
            agents,
            nodes,
            status_cache,
            tokens,
            pending: PendingProbes::default(),
            probe_timeout,
            ping_extension,
            default_ping_count,
            default_ping_interval,
        }
    }

    pub async fn probe_rule(
        &self,
        rule_sid: &str,
        ip_version_override: Option<IpVersion>,
    ) -> CoreResult<RuleProbeResponse> {
        let rule = self.rules.get_by_sid(rule_sid).await?;
        match rule.rule_type {
            RuleType::Direct | RuleType::External => self.probe_direct(&rule, ip_version_override).await,
            RuleType::Entry => self.probe_entry(&rule, ip_version_override).await,
            RuleType::Chain => self.probe_chain(&rule, ip_version_override, true).await,
            RuleType::DirectChain => self.probe_chain(&rule, ip_version_override, false).await,
        }
    }

    async fn resolve_target(&self, rule: &ForwardingRule, ip_override: Option<IpVersion>) -> (String, u16) {
        if let Some(node_id) = rule.target_node_id {
            match self.nodes.get(node_id).await {
                Ok(node) => {
                    if let Some(address) = node.resolve_address(ip_override.unwrap_or(rule.ip_version)) {
                        return (address, rule.target_port);
                    }
                    warn!(rule = %rule.sid, node = node_id, "node has no address for requested ip version, falling back to rule target");
                }
                Err(e) => warn!(rule = %rule.sid, node = node_id, error = %e, "node lookup failed, falling back to rule target"),
            }
        }
        (rule.target_address.clone(), rule.target_port)
    }

    /// Sends one `probe_task` to `source_agent_id` and awaits its
    /// correlated reply, or `ProbeTimeout` after `timeout_for`.
    async fn run_probe(
        &self,
        source_agent_id: EntityId,
        source_agent_sid: &str,
        task: ProbeTask,
        timeout_for: Duration,
    ) -> CoreResult<ProbeResult> {
        let task_id = task.id.clone();
        let rx = self.pending.register(task_id.clone());

        let envelope = Envelope::new(server_msg::PROBE_TASK, source_agent_sid, now_ts(), &task)
            .map_err(|e| CoreError::Internal(format!("failed to encode probe task: {e}")))?;
        if let Err(e) = self.hub.send_message_to_agent(source_agent_id, envelope) {
            self.pending.unregister(&task_id);
            return Err(e);
        }

        match timeout(timeout_for, rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(CoreError::ProbeFailed("pending probe slot dropped".into())),
            Err(_) => {
                self.pending.unregister(&task_id);
                Err(CoreError::ProbeTimeout)
            }
        }
    }

    fn new_task_id() -> String {
        Uuid::new_v4().simple().to_string()
    }

    async fn probe_direct(&self, rule: &ForwardingRule, ip_override: Option<IpVersion>) -> CoreResult<RuleProbeResponse> {
        if !self.hub.has_session(rule.agent_id) {
            return Err(CoreError::AgentNotConnected);
        }
        let agent = self.agents.get(rule.agent_id).await?;
        let (target, port) = self.resolve_target(rule, ip_override).await;
        let task = ProbeTask {
            id: Self::new_task_id(),
            task_type: ProbeTaskType::Target,
            rule_id: rule.sid.clone(),
            target,
            port,
            protocol: protocol_str(rule.protocol),
            timeout_ms: self.probe_timeout.as_millis() as u64,
            tunnel_type: None,
            tunnel_token: None,
            ping_count: None,
            ping_interval_ms: None,
            tunnel_conn_timeout: None,
        };
        let result = self.run_probe(rule.agent_id, &agent.sid, task, self.probe_timeout).await?;
        Ok(RuleProbeResponse {
            success: result.success,
            target_latency_ms: result.latency_ms,
            total_latency_ms: result.latency_ms,
            error: result.error,
            ..Default::default()
        })
    }

    async fn probe_entry(&self, rule: &ForwardingRule, ip_override: Option<IpVersion>) -> CoreResult<RuleProbeResponse> {
        let Some(exit_id) = rule.exit_agent_id else {
            return Err(CoreError::ValidationFailed("entry rule missing exit_agent_id".into()));
        };
        if !self.hub.has_session(rule.agent_id) {
            return Err(CoreError::AgentNotConnected);
        }
        let entry_agent = self.agents.get(rule.agent_id).await?;
        let exit_agent = self.agents.get(exit_id).await?;

        // The tunnel_ping needs the exit's currently advertised WS/TLS
        // listen port (whichever the rule's tunnel_type calls for) the same
        // way the converter resolves a tunnel-mode next hop (§4.2). A
        // stale/missing status (e.g. the exit has never reported one, or
        // went offline before ever reporting) means there is no port to
        // dial and the probe cannot even be sent.
        let exit_status = self.status_cache.get(exit_id).await;
        let tunnel_port = exit_status.as_ref().and_then(|s| match rule.tunnel_type {
            fabric_protocol::TunnelType::Ws => s.ws_listen_port,
            fabric_protocol::TunnelType::Tls => s.tls_listen_port,
        });
        let Some(tunnel_port) = tunnel_port else {
            return Ok(RuleProbeResponse {
                success: false,
                error: Some("exit agent status missing ws/tls listen port".into()),
                ..Default::default()
            });
        };

        let tunnel_token = self.tokens.generate(&exit_agent.sid).ok();
        let tunnel_target = exit_agent.effective_tunnel_address().to_string();
        let ping_extension = self.ping_extension * self.default_ping_count;
        let ping_task = ProbeTask {
            id: Self::new_task_id(),
            task_type: ProbeTaskType::TunnelPing,
            rule_id: rule.sid.clone(),
            target: tunnel_target,
            port: tunnel_port,
            protocol: protocol_str(Protocol::Tcp),
            timeout_ms: (self.probe_timeout + ping_extension).as_millis() as u64,
            tunnel_type: Some(tunnel_type_str(rule.tunnel_type)),
            tunnel_token,
            ping_count: Some(self.default_ping_count),
            ping_interval_ms: Some(self.default_ping_interval.as_millis() as u64),
            tunnel_conn_timeout: Some(self.probe_timeout.as_millis() as u64),
        };
        let ping_result = self
            .run_probe(rule.agent_id, &entry_agent.sid, ping_task, self.probe_timeout + ping_extension)
            .await?;

        if !ping_result.success || !self.hub.has_session(exit_id) {
            return Ok(RuleProbeResponse {
                success: false,
                tunnel_min_latency_ms: ping_result.min_latency_ms,
                tunnel_max_latency_ms: ping_result.max_latency_ms,
                tunnel_avg_latency_ms: ping_result.avg_latency_ms,
                tunnel_packet_loss: ping_result.packet_loss,
                error: ping_result.error.or_else(|| Some("exit agent not connected".into())),
                ..Default::default()
            });
        }

        let (target, port) = self.resolve_target(rule, ip_override).await;
        let target_task = ProbeTask {
            id: Self::new_task_id(),
            task_type: ProbeTaskType::Target,
            rule_id: rule.sid.clone(),
            target,
            port,
            protocol: protocol_str(rule.protocol),
            timeout_ms: self.probe_timeout.as_millis() as u64,
            tunnel_type: None,
            tunnel_token: None,
            ping_count: None,
            ping_interval_ms: None,
            tunnel_conn_timeout: None,
        };
        let target_result = self.run_probe(exit_id, &exit_agent.sid, target_task, self.probe_timeout).await?;

        let total = match (ping_result.avg_latency_ms, target_result.latency_ms) {
            (Some(a), Some(b)) => Some(a + b),
            _ => None,
        };
        Ok(RuleProbeResponse {
            success: target_result.success,
            target_latency_ms: target_result.latency_ms,
            total_latency_ms: total,
            tunnel_min_latency_ms: ping_result.min_latency_ms,
            tunnel_max_latency_ms: ping_result.max_latency_ms,
            tunnel_avg_latency_ms: ping_result.avg_latency_ms,
            tunnel_packet_loss: ping_result.packet_loss,
            error: target_result.error,
            ..Default::default()
        })
    }

    async fn probe_chain(
        &self,
        rule: &ForwardingRule,
        ip_override: Option<IpVersion>,
        tunnel_aware: bool,
    ) -> CoreResult<RuleProbeResponse> {
        let chain = rule.full_chain();
        let mut agents_by_id: HashMap<EntityId, crate::domain::ForwardingAgent> = HashMap::new();
        for id in &chain {
            agents_by_id.insert(*id, self.agents.get(*id).await?);
        }

        let mut hops = Vec::with_capacity(chain.len());
        let mut all_succeeded = true;
        let mut last_target_latency = None;
        let mut total = 0u64;
        let mut have_total = false;

        for (position, source_id) in chain.iter().enumerate() {
            let source_agent = &agents_by_id[source_id];
            let is_final = position == chain.len() - 1;

            if !self.hub.has_session(*source_id) {
                hops.push(HopProbeResult {
                    agent_sid: source_agent.sid.clone(),
                    success: false,
                    latency_ms: None,
                    error: Some("agent not connected".into()),
                });
                all_succeeded = false;
                continue;
            }

            let result = if is_final {
                let (target, port) = self.resolve_target(rule, ip_override).await;
                let task = ProbeTask {
                    id: Self::new_task_id(),
                    task_type: ProbeTaskType::Target,
                    rule_id: rule.sid.clone(),
                    target,
                    port,
                    protocol: protocol_str(rule.protocol),
                    timeout_ms: self.probe_timeout.as_millis() as u64,
                    tunnel_type: None,
                    tunnel_token: None,
                    ping_count: None,
                    ping_interval_ms: None,
                    tunnel_conn_timeout: None,
                };
                self.run_probe(*source_id, &source_agent.sid, task, self.probe_timeout).await
            } else {
                let next_id = chain[position + 1];
                let next_agent = &agents_by_id[&next_id];
                let use_tunnel = tunnel_aware
                    && crate::converter::hop_mode_at(position, rule.tunnel_hops).1 == fabric_protocol::HopMode::Tunnel;

                let task = if use_tunnel {
                    let status = self.status_cache.get(next_id).await;
                    let port = match rule.protocol {
                        Protocol::Tcp if rule.tunnel_type == fabric_protocol::TunnelType::Tls => {
                            status.as_ref().and_then(|s| s.tls_listen_port)
                        }
                        _ => status.as_ref().and_then(|s| s.ws_listen_port),
                    }
                    .unwrap_or(0);
                    ProbeTask {
                        id: Self::new_task_id(),
                        task_type: ProbeTaskType::Tunnel,
                        rule_id: rule.sid.clone(),
                        target: next_agent.effective_tunnel_address().to_string(),
                        port,
                        protocol: protocol_str(Protocol::Tcp),
                        timeout_ms: self.probe_timeout.as_millis() as u64,
                        tunnel_type: Some(tunnel_type_str(rule.tunnel_type)),
                        tunnel_token: self.tokens.generate(&next_agent.sid).ok(),
                        ping_count: None,
                        ping_interval_ms: None,
                        tunnel_conn_timeout: Some(self.probe_timeout.as_millis() as u64),
                    }
                } else {
                    let port = rule.chain_port_config.get(&next_id).copied().unwrap_or(0);
                    ProbeTask {
                        id: Self::new_task_id(),
                        task_type: ProbeTaskType::Target,
                        rule_id: rule.sid.clone(),
                        target: next_agent.public_address.clone(),
                        port,
                        protocol: protocol_str(rule.protocol),
                        timeout_ms: self.probe_timeout.as_millis() as u64,
                        tunnel_type: None,
                        tunnel_token: None,
                        ping_count: None,
                        ping_interval_ms: None,
                        tunnel_conn_timeout: None,
                    }
                };
                self.run_probe(*source_id, &source_agent.sid, task, self.probe_timeout).await
            };

            match result {
                Ok(probe_result) => {
                    if is_final {
                        last_target_latency = probe_result.latency_ms;
                    }
                    if let Some(ms) = probe_result.latency_ms {
                        total += ms;
                        have_total = true;
                    }
                    if !probe_result.success {
                        all_succeeded = false;
                    }
                    hops.push(HopProbeResult {
                        agent_sid: source_agent.sid.clone(),
                        success: probe_result.success,
                        latency_ms: probe_result.latency_ms,
                        error: probe_result.error,
                    });
                }
                Err(e) => {
                    all_succeeded = false;
                    hops.push(HopProbeResult {
                        agent_sid: source_agent.sid.clone(),
                        success: false,
                        latency_ms: None,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        Ok(RuleProbeResponse {
            success: all_succeeded,
            target_latency_ms: last_target_latency,
            total_latency_ms: have_total.then_some(total),
            hops,
            ..Default::default()
        })
    }

    /// Feeds an inbound `probe_result` to its waiting correlation slot.
    /// A `task_id` with no registered waiter (late reply past timeout, or
    /// an unsolicited result) is dropped silently.
    pub fn handle_probe_result(&self, result: ProbeResult) {
        let task_id = result.task_id.clone();
        self.pending.deliver(&task_id, result);
    }
}

fn now_ts() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryAgentStatusCache;
    use crate::domain::{AgentRecordStatus, ForwardingAgent};
    use crate::repository::{InMemoryAgentRepository, InMemoryNodeRepository, InMemoryRuleRepository};
    use fabric_protocol::{Protocol as WireProtocol, RuleStatus, TunnelType};
    use std::collections::HashMap as StdHashMap;

    fn agent(id: EntityId, sid: &str) -> ForwardingAgent {
        ForwardingAgent {
            id,
            sid: sid.to_string(),
            public_address: format!("10.0.0.{id}"),
            tunnel_address: None,
            token_hash: String::new(),
            status: AgentRecordStatus::Active,
            platform: "linux".into(),
            arch: "x86_64".into(),
            agent_version: "1.0.0".into(),
            allowed_port_range: None,
            blocked_protocols: Vec::new(),
            last_seen_at: 0,
            group_ids: Vec::new(),
        }
    }

    fn direct_rule() -> ForwardingRule {
        ForwardingRule {
            id: 1,
            sid: "fr_A".into(),
            rule_type: RuleType::Direct,
            agent_id: 1,
            exit_agent_id: None,
            chain_agent_ids: Vec::new(),
            chain_port_config: StdHashMap::new(),
            listen_port: 8080,
            target_address: "10.0.0.5".into(),
            target_port: 80,
            target_node_id: None,
            bind_ip: None,
            protocol: WireProtocol::Tcp,
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

    async fn orchestrator_with(
        agents: Vec<ForwardingAgent>,
        rules: Vec<ForwardingRule>,
    ) -> (Arc<AgentHub>, Arc<ProbeOrchestrator>) {
        let agent_repo = Arc::new(InMemoryAgentRepository::new());
        for a in agents {
            agent_repo.upsert(a).await.unwrap();
        }
        let rule_repo = Arc::new(InMemoryRuleRepository::new());
        for r in rules {
            rule_repo.upsert(r).await.unwrap();
        }
        let hub = AgentHub::new(4, Duration::from_secs(30), Duration::from_secs(60));
        let orchestrator = Arc::new(ProbeOrchestrator::new(
            hub.clone(),
            rule_repo,
            agent_repo,
            Arc::new(InMemoryNodeRepository::new()),
            Arc::new(InMemoryAgentStatusCache::new()),
            Arc::new(TokenService::new(b"secret".to_vec(), Duration::from_secs(60))),
            Duration::from_millis(200),
            Duration::from_millis(50),
            3,
            Duration::from_millis(10),
        ));
        (hub, orchestrator)
    }

    #[tokio::test]
    async fn direct_probe_times_out_when_agent_never_replies() {
        let (hub, orchestrator) = orchestrator_with(vec![agent(1, "fa_1")], vec![direct_rule()]).await;
        let _session = hub.register(1, "fa_1".into()).await;

        let err = orchestrator.probe_rule("fr_A", None).await.unwrap_err();
        assert!(matches!(err, CoreError::ProbeTimeout));
    }

    #[tokio::test]
    async fn direct_probe_fails_fast_when_agent_offline() {
        let (_hub, orchestrator) = orchestrator_with(vec![agent(1, "fa_1")], vec![direct_rule()]).await;
        let err = orchestrator.probe_rule("fr_A", None).await.unwrap_err();
        assert!(matches!(err, CoreError::AgentNotConnected));
    }

    #[tokio::test]
    async fn direct_probe_correlates_a_successful_reply() {
        let (hub, orchestrator) = orchestrator_with(vec![agent(1, "fa_1")], vec![direct_rule()]).await;
        let mut session = hub.register(1, "fa_1".into()).await;

        let probe_fut = orchestrator.probe_rule("fr_A", None);
        let reader = tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move {
                let envelope = session.rx.recv().await.expect("probe task sent");
                let task: ProbeTask = envelope.decode().unwrap();
                orchestrator.handle_probe_result(ProbeResult {
                    task_id: task.id,
                    task_type: ProbeTaskType::Target,
                    rule_id: task.rule_id,
                    success: true,
                    latency_ms: Some(42),
                    error: None,
                    min_latency_ms: None,
                    max_latency_ms: None,
                    avg_latency_ms: None,
                    packet_loss: None,
                    pings_sent: None,
                    pings_recv: None,
                });
            }
        });

        let response = probe_fut.await.unwrap();
        reader.await.unwrap();
        assert!(response.success);
        assert_eq!(response.target_latency_ms, Some(42));
        assert_eq!(response.total_latency_ms, Some(42));
    }

    fn entry_rule(entry_agent_id: EntityId, exit_agent_id: EntityId) -> ForwardingRule {
        let mut rule = direct_rule();
        rule.rule_type = RuleType::Entry;
        rule.agent_id = entry_agent_id;
        rule.exit_agent_id = Some(exit_agent_id);
        rule
    }

    #[tokio::test]
    async fn entry_probe_fails_fast_when_exit_status_missing_tunnel_port() {
        // entry fa_1 online, exit fa_2 never reported a status, so no
        // ws_listen_port/tls_listen_port is cached for it.
        let (hub, orchestrator) = orchestrator_with(
            vec![agent(1, "fa_1"), agent(2, "fa_2")],
            vec![entry_rule(1, 2)],
        )
        .await;
        let mut entry_session = hub.register(1, "fa_1".into()).await;

        let response = orchestrator.probe_rule("fr_A", None).await.unwrap();

        assert!(!response.success);
        assert!(response
            .error
            .as_deref()
            .is_some_and(|e| e.contains("exit agent status")));
        // No tunnel_ping (or any other) probe task was ever sent to the
        // entry agent, since there is no port to dial.
        assert!(entry_session.rx.try_recv().is_err());
    }
}
