//! # Forwarding Fabric Control Plane
//!
//! The control plane for a distributed TCP/UDP forwarding fabric: a central
//! server that agents dial into over a single persistent WebSocket, which
//! then:
//!
//! ```text
//! Agent ──WS──► Agent Hub ──┬─► Config Sync Engine ──► Rule-to-Agent Converter
//!                           ├─► Probe Orchestrator
//!                           └─► Traffic Buffer ──► Limit Enforcer
//! ```
//!
//! ## Modules
//!
//! - [`hub`]       — the agent connection registry and message router
//! - [`domain`]    — core entities (rules, agents, nodes)
//! - [`repository`]/[`cache`] — the storage seams those entities read through
//! - [`converter`] — projects a rule into an agent-facing [`fabric_protocol::RuleView`]
//! - [`affected`]  — finds which agents a mutation invalidates
//! - [`sync`]      — pushes config syncs and tracks per-agent ack versions
//! - [`probe`]     — ad hoc and on-demand latency probing
//! - [`traffic`]   — sharded accumulation of traffic reports
//! - [`limits`]    — traffic-limit enforcement
//! - [`token`]     — stateless signed bearer tokens
//! - [`state`]     — wires every component above into one [`AppState`]
//! - [`handlers`]  — the WebSocket entry point and hub glue
//! - [`api`]       — REST endpoints

mod affected;
mod api;
mod cache;
mod config;
mod converter;
mod domain;
mod error;
mod handlers;
mod hub;
mod limits;
mod probe;
mod repository;
mod state;
mod sync;
mod token;
mod traffic;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::config::ServerConfig;
use crate::state::AppState;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fabric_server=info".into()),
        )
        .init();

    let config = ServerConfig::from_env();
    let bind_addr = config.bind_addr;
    let state = AppState::new(config);

    handlers::install_hub_handlers(&state).await;
    state.traffic.start().await;

    let app = Router::new()
        .route("/healthz", get(api::healthz))
        .route("/ws/agent", get(handlers::ws_agent_handler))
        .route("/api/agents", get(api::list_agents))
        .route("/api/agents/{sid}/online", get(api::agent_online))
        .route("/api/rules/{sid}/probe", post(api::probe_rule))
        .route("/api/traffic", post(api::report_traffic))
        .route("/api/broadcast/api-url", post(api::broadcast_api_url_changed))
        .layer(CorsLayer::permissive())
        .with_state(state.clone());

    info!(%bind_addr, "forwarding fabric control plane listening");

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .expect("failed to bind listener");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    state.traffic.stop().await;
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install ctrl_c handler");
    info!("shutdown signal received");
}
