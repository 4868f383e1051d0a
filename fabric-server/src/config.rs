//! Server configuration: every tunable the spec names by value, read once
//! at startup from the environment with defaults matching the spec's
//! constants. Keeping these in one place means a deployment can tune, say,
//! the flush interval without hunting through `traffic.rs` for a literal.

use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,

    /// Bounded outbound queue depth per agent session (§4.1, spec: 256).
    pub send_queue_depth: usize,
    /// Server-initiated liveness ping period (§4.1/§6, spec: 30s).
    pub ping_period: Duration,
    /// Read-deadline extension on ping/pong (§4.1/§6, spec: 60s).
    pub pong_wait: Duration,
    /// Write deadline for a single frame (§4.1/§6, spec: 10s).
    pub write_wait: Duration,
    /// How stale `last_seen_at` may be before an agent is no longer
    /// considered online (§3, spec: 5 minutes).
    pub staleness_window: Duration,

    /// Base probe timeout (§4.5, spec: 10s).
    pub probe_timeout: Duration,
    /// Extra wait per ping in a `tunnel_ping` probe (§4.5, spec: 1s).
    pub probe_ping_extension: Duration,
    /// Default ping count for a `tunnel_ping` probe (§4.5, spec: 3).
    pub default_ping_count: u32,
    /// Default interval between pings in a `tunnel_ping` probe (§4.5, spec:
    /// 200ms).
    pub default_ping_interval: Duration,

    /// Number of traffic buffer shards (§4.6, spec: 16).
    pub traffic_shards: usize,
    /// Traffic flush period (§4.6, spec: 5s).
    pub flush_interval: Duration,
    /// Max entries per flush batch (§4.6, spec: 500).
    pub flush_batch_cap: usize,
    /// Retries before a flush entry is dropped (§4.6, spec: 10).
    pub flush_max_retry: u32,

    /// Page size when disabling a user's rules (§4.7, spec: 100).
    pub limit_enforcer_page_size: usize,

    /// Secret used to sign hop-to-hop and full-sync client tokens.
    pub token_secret: Vec<u8>,
    /// How long an issued token remains valid.
    pub token_ttl: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:7070".parse().expect("valid default bind addr"),
            send_queue_depth: 256,
            ping_period: Duration::from_secs(30),
            pong_wait: Duration::from_secs(60),
            write_wait: Duration::from_secs(10),
            staleness_window: Duration::from_secs(5 * 60),
            probe_timeout: Duration::from_secs(10),
            probe_ping_extension: Duration::from_secs(1),
            default_ping_count: 3,
            default_ping_interval: Duration::from_millis(200),
            traffic_shards: 16,
            flush_interval: Duration::from_secs(5),
            flush_batch_cap: 500,
            flush_max_retry: 10,
            limit_enforcer_page_size: 100,
            token_secret: b"change-me-in-production".to_vec(),
            token_ttl: Duration::from_secs(60),
        }
    }
}

impl ServerConfig {
    /// Loads overrides from the environment, falling back to spec-mandated
    /// defaults for anything unset. `RUST_LOG` is handled separately by
    /// `tracing_subscriber::EnvFilter`, not here.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(addr) = std::env::var("FABRIC_BIND_ADDR") {
            if let Ok(parsed) = addr.parse() {
                cfg.bind_addr = parsed;
            }
        }
        if let Ok(secret) = std::env::var("FABRIC_TOKEN_SECRET") {
            cfg.token_secret = secret.into_bytes();
        }
        if let Ok(depth) = std::env::var("FABRIC_SEND_QUEUE_DEPTH") {
            if let Ok(parsed) = depth.parse() {
                cfg.send_queue_depth = parsed;
            }
        }

        cfg
    }
}
