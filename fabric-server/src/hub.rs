//! # Agent Hub (spec §4.1)
//!
//! Owns at most one live session per agent ID, routes inbound envelopes to
//! either the three built-in message types or a list of pluggable
//! [`MessageHandler`]s, and fans outbound commands/syncs/probes out over
//! each session's bounded send queue.
//!
//! Modeled on the teacher's `AppState` agent registry (`DashMap<String,
//! AgentInfo>` plus an `mpsc::UnboundedSender` per connection) but bounded
//! — an unbounded queue can never report back-pressure, and §4.1 requires
//! `SendChannelFull` instead of unbounded growth — and keyed by numeric
//! agent ID with a generation counter so a reconnecting agent can replace
//! its old session without a race against that old session's own cleanup.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use fabric_protocol::{agent_msg, server_msg, AgentEvent, AgentStatusReport, CommandPayload, Envelope};
use futures::FutureExt;
use tokio::sync::{mpsc, RwLock};
use tracing::{error, warn};

use crate::domain::EntityId;
use crate::error::{CoreError, CoreResult};

/// Sentinel `msg_type` the hub pushes onto a session's send queue to ask
/// the owning connection's writer loop to emit a transport-level
/// keepalive. Never appears on the wire itself — the writer loop
/// recognizes it and sends whatever the transport's native ping frame is
/// instead of a JSON text frame.
pub const LIVENESS_PING_SENTINEL: &str = "__hub_liveness_ping__";

/// A handler for one of the three message types the hub treats as
/// built-in (status, heartbeat, event). Registered once per hub; unlike
/// [`MessageHandler`]s these always run and never compete for a single
/// consuming handler, since they represent hub-level bookkeeping more
/// than business logic dispatch.
#[async_trait]
pub trait BuiltinMessageSink: Send + Sync {
    async fn on_status(&self, agent_id: EntityId, report: AgentStatusReport);
    async fn on_heartbeat(&self, agent_id: EntityId);
    async fn on_event(&self, agent_id: EntityId, event: AgentEvent);
}

/// A pluggable consumer of every non-built-in inbound message type
/// (`probe_result`, `config_ack`, `rule_sync_status`, `tunnel_health_report`,
/// `traffic`, and anything a deployment adds later). Handlers run in
/// registration order; the first one to return `true` consumes the
/// message and stops dispatch.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(
        &self,
        agent_id: EntityId,
        agent_sid: &str,
        msg_type: &str,
        data: &serde_json::Value,
    ) -> bool;
}

/// Lifecycle callback fired after a session is registered / torn down.
#[async_trait]
pub trait AgentLifecycleHook: Send + Sync {
    async fn on_agent_online(&self, agent_id: EntityId);
    async fn on_agent_offline(&self, agent_id: EntityId);
}

struct AgentSession {
    agent_sid: String,
    generation: u64,
    tx: mpsc::Sender<Envelope>,
    last_seen: std::sync::Mutex<Instant>,
}

impl AgentSession {
    fn touch(&self) {
        *self.last_seen.lock().expect("session lock poisoned") = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_seen
            .lock()
            .expect("session lock poisoned")
            .elapsed()
    }
}

/// A freshly registered session handle, returned to the caller that will
/// drive the physical connection (read loop + writer loop).
pub struct RegisteredSession {
    pub agent_id: EntityId,
    pub generation: u64,
    pub rx: mpsc::Receiver<Envelope>,
}

pub struct AgentHub {
    send_queue_depth: usize,
    ping_period: Duration,
    pong_wait: Duration,
    sessions: DashMap<EntityId, Arc<AgentSession>>,
    next_generation: AtomicU64,
    builtin_sink: RwLock<Option<Arc<dyn BuiltinMessageSink>>>,
    handlers: RwLock<Vec<Arc<dyn MessageHandler>>>,
    hooks: RwLock<Vec<Arc<dyn AgentLifecycleHook>>>,
}

impl AgentHub {
    pub fn new(send_queue_depth: usize, ping_period: Duration, pong_wait: Duration) -> Arc<Self> {
        Arc::new(Self {
            send_queue_depth,
            ping_period,
            pong_wait,
            sessions: DashMap::new(),
            next_generation: AtomicU64::new(1),
            builtin_sink: RwLock::new(None),
            handlers: RwLock::new(Vec::new()),
            hooks: RwLock::new(Vec::new()),
        })
    }

    pub async fn set_builtin_sink(&self, sink: Arc<dyn BuiltinMessageSink>) {
        *self.builtin_sink.write().await = Some(sink);
    }

    pub async fn register_message_handler(&self, handler: Arc<dyn MessageHandler>) {
        self.handlers.write().await.push(handler);
    }

    pub async fn register_lifecycle_hook(&self, hook: Arc<dyn AgentLifecycleHook>) {
        self.hooks.write().await.push(hook);
    }

    /// Registers a freshly authenticated connection as the session for
    /// `agent_id`. If a prior session exists it is replaced: its sender is
    /// dropped here, which closes its receiver and ends its writer loop on
    /// the next `recv()`, before the new session is visible to callers —
    /// satisfying "no interval in which both old and new are addressable"
    /// (spec testable property 5). `OnAgentOnline` fires after the new
    /// session is installed.
    pub async fn register(self: &Arc<Self>, agent_id: EntityId, agent_sid: String) -> RegisteredSession {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(self.send_queue_depth);
        let session = Arc::new(AgentSession {
            agent_sid,
            generation,
            tx,
            last_seen: std::sync::Mutex::new(Instant::now()),
        });
        self.sessions.insert(agent_id, session);

        let hub = Arc::clone(self);
        tokio::spawn(async move { hub.run_liveness_task(agent_id, generation).await });

        self.fire_online(agent_id).await;
        RegisteredSession {
            agent_id,
            generation,
            rx,
        }
    }

    /// Tears down the session for `agent_id`, but only if it is still the
    /// one identified by `generation` — a stale cleanup from an already-
    /// replaced connection is a safe no-op.
    pub async fn unregister(&self, agent_id: EntityId, generation: u64) {
        let matched = matches!(self.sessions.get(&agent_id), Some(s) if s.generation == generation);
        if !matched {
            return;
        }
        self.sessions.remove(&agent_id);
        self.fire_offline(agent_id).await;
    }

    async fn fire_online(&self, agent_id: EntityId) {
        let hooks = self.hooks.read().await.clone();
        for hook in hooks {
            hook.on_agent_online(agent_id).await;
        }
    }

    async fn fire_offline(&self, agent_id: EntityId) {
        let hooks = self.hooks.read().await.clone();
        for hook in hooks {
            hook.on_agent_offline(agent_id).await;
        }
    }

    async fn run_liveness_task(self: Arc<Self>, agent_id: EntityId, generation: u64) {
        loop {
            tokio::time::sleep(self.ping_period).await;
            let Some(session) = self.sessions.get(&agent_id).map(|s| s.clone()) else {
                return;
            };
            if session.generation != generation {
                return;
            }
            let ping = Envelope {
                msg_type: LIVENESS_PING_SENTINEL.to_string(),
                agent_id: session.agent_sid.clone(),
                timestamp: 0,
                data: serde_json::Value::Null,
            };
            if session.tx.try_send(ping).is_err() {
                self.unregister(agent_id, generation).await;
                return;
            }
            tokio::time::sleep(self.pong_wait).await;
            let Some(session) = self.sessions.get(&agent_id).map(|s| s.clone()) else {
                return;
            };
            if session.generation != generation {
                return;
            }
            if session.idle_for() >= self.pong_wait {
                self.unregister(agent_id, generation).await;
                return;
            }
        }
    }

    /// Extends a session's liveness deadline. Called on every inbound
    /// frame, not just ping/pong, since any traffic proves the channel is
    /// alive.
    pub fn touch(&self, agent_id: EntityId) {
        if let Some(session) = self.sessions.get(&agent_id) {
            session.touch();
        }
    }

    pub fn has_session(&self, agent_id: EntityId) -> bool {
        self.sessions.contains_key(&agent_id)
    }

    pub fn online_agent_ids(&self) -> Vec<EntityId> {
        self.sessions.iter().map(|e| *e.key()).collect()
    }

    /// `SendMessageToAgent`: enqueues a pre-built envelope. Never blocks —
    /// a full queue fails fast with `SendChannelFull` rather than
    /// suspending the caller, per §5's suspension-point contract.
    pub fn send_message_to_agent(&self, agent_id: EntityId, envelope: Envelope) -> CoreResult<()> {
        let session = self
            .sessions
            .get(&agent_id)
            .ok_or(CoreError::AgentNotConnected)?;
        session
            .tx
            .try_send(envelope)
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => CoreError::SendChannelFull,
                mpsc::error::TrySendError::Closed(_) => CoreError::AgentNotConnected,
            })
    }

    /// `SendCommandToAgent`: wraps a command payload in an envelope and
    /// sends it.
    pub fn send_command_to_agent(&self, agent_id: EntityId, command: CommandPayload) -> CoreResult<()> {
        let agent_sid = self
            .sessions
            .get(&agent_id)
            .map(|s| s.agent_sid.clone())
            .ok_or(CoreError::AgentNotConnected)?;
        let envelope = Envelope::new(server_msg::COMMAND, agent_sid, now_ts(), command)
            .map_err(|e| CoreError::Internal(e.to_string()))?;
        self.send_message_to_agent(agent_id, envelope)
    }

    /// `BroadcastAPIURLChanged`: emits a `command` envelope to every online
    /// session. Returns `(agents_notified, agents_online)`.
    pub fn broadcast_api_url_changed(&self, new_url: &str, reason: &str) -> (usize, usize) {
        let command = CommandPayload::api_url_changed(new_url, reason);
        let ids: Vec<EntityId> = self.sessions.iter().map(|e| *e.key()).collect();
        let online = ids.len();
        let mut notified = 0;
        for agent_id in ids {
            if self
                .send_command_to_agent(agent_id, command.clone())
                .is_ok()
            {
                notified += 1;
            }
        }
        (notified, online)
    }

    /// `RouteAgentMessage`: dispatches one decoded inbound message. Built-in
    /// types are handled directly; everything else walks the registered
    /// handler list until one consumes it. A handler panic is caught,
    /// logged, and treated as "did not consume" so one bad handler cannot
    /// take down the session loop.
    pub async fn route_agent_message(
        &self,
        agent_id: EntityId,
        agent_sid: &str,
        msg_type: &str,
        data: serde_json::Value,
    ) {
        self.touch(agent_id);

        match msg_type {
            agent_msg::STATUS => {
                match serde_json::from_value::<AgentStatusReport>(data) {
                    Ok(report) => {
                        if let Some(sink) = self.builtin_sink.read().await.clone() {
                            sink.on_status(agent_id, report).await;
                        }
                    }
                    Err(e) => warn!(agent_id, error = %e, "malformed status payload, dropping"),
                }
            }
            agent_msg::HEARTBEAT => {
                if let Some(sink) = self.builtin_sink.read().await.clone() {
                    sink.on_heartbeat(agent_id).await;
                }
            }
            agent_msg::EVENT => match serde_json::from_value::<AgentEvent>(data) {
                Ok(event) => {
                    if let Some(sink) = self.builtin_sink.read().await.clone() {
                        sink.on_event(agent_id, event).await;
                    }
                }
                Err(e) => warn!(agent_id, error = %e, "malformed event payload, dropping"),
            },
            other => {
                let handlers = self.handlers.read().await.clone();
                for handler in handlers {
                    let outcome = std::panic::AssertUnwindSafe(
                        handler.handle_message(agent_id, agent_sid, other, &data),
                    )
                    .catch_unwind()
                    .await;
                    match outcome {
                        Ok(true) => break,
                        Ok(false) => continue,
                        Err(_) => {
                            error!(agent_id, msg_type = other, "message handler panicked, dropping message");
                            continue;
                        }
                    }
                }
            }
        }
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

    #[tokio::test]
    async fn register_then_send_delivers_to_queue() {
        let hub = AgentHub::new(4, Duration::from_secs(30), Duration::from_secs(60));
        let mut registered = hub.register(1, "fa_1".into()).await;
        let envelope = Envelope::new("command", "fa_1", 0, serde_json::json!({"action":"reload_config"}))
            .unwrap();
        hub.send_message_to_agent(1, envelope).unwrap();
        let received = registered.rx.recv().await.unwrap();
        assert_eq!(received.msg_type, "command");
    }

    #[tokio::test]
    async fn send_to_unknown_agent_fails_not_connected() {
        let hub = AgentHub::new(4, Duration::from_secs(30), Duration::from_secs(60));
        let envelope = Envelope::new("command", "fa_1", 0, serde_json::json!({})).unwrap();
        let err = hub.send_message_to_agent(99, envelope).unwrap_err();
        assert!(matches!(err, CoreError::AgentNotConnected));
    }

    #[tokio::test]
    async fn full_queue_fails_with_send_channel_full() {
        let hub = AgentHub::new(1, Duration::from_secs(30), Duration::from_secs(60));
        let _registered = hub.register(1, "fa_1".into()).await;
        let e1 = Envelope::new("command", "fa_1", 0, serde_json::json!({})).unwrap();
        let e2 = Envelope::new("command", "fa_1", 0, serde_json::json!({})).unwrap();
        hub.send_message_to_agent(1, e1).unwrap();
        let err = hub.send_message_to_agent(1, e2).unwrap_err();
        assert!(matches!(err, CoreError::SendChannelFull));
    }

    #[tokio::test]
    async fn reregister_replaces_prior_session_exclusively() {
        let hub = AgentHub::new(4, Duration::from_secs(30), Duration::from_secs(60));
        let first = hub.register(1, "fa_1".into()).await;
        let _second = hub.register(1, "fa_1".into()).await;

        // The old generation's channel is now closed; sends against the
        // live agent_id succeed (they reach the new session), but the
        // original receiver observes closure rather than new traffic.
        let envelope = Envelope::new("command", "fa_1", 0, serde_json::json!({})).unwrap();
        hub.send_message_to_agent(1, envelope).unwrap();
        drop(first);
    }

    struct CountingHandler {
        calls: std::sync::atomic::AtomicUsize,
        consume: bool,
    }

    #[async_trait]
    impl MessageHandler for CountingHandler {
        async fn handle_message(
            &self,
            _agent_id: EntityId,
            _agent_sid: &str,
            _msg_type: &str,
            _data: &serde_json::Value,
        ) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.consume
        }
    }

    #[tokio::test]
    async fn first_consuming_handler_stops_dispatch() {
        let hub = AgentHub::new(4, Duration::from_secs(30), Duration::from_secs(60));
        let _registered = hub.register(1, "fa_1".into()).await;
        let first = Arc::new(CountingHandler {
            calls: std::sync::atomic::AtomicUsize::new(0),
            consume: true,
        });
        let second = Arc::new(CountingHandler {
            calls: std::sync::atomic::AtomicUsize::new(0),
            consume: true,
        });
        hub.register_message_handler(first.clone()).await;
        hub.register_message_handler(second.clone()).await;

        hub.route_agent_message(1, "fa_1", "traffic", serde_json::json!({})).await;

        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);
    }
}
