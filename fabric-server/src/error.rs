//! Error kinds shared across every control-plane component (spec §7).
//!
//! These are kinds, not one variant per failing subsystem: a repository
//! failure and a cache failure both become `TransientCacheFailure` /
//! `PersistentStoreFailure` regardless of which concrete store raised it,
//! so callers can match on the *policy* (retry? surface to the operator?
//! log and move on?) without caring about the storage backend.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("agent not connected")]
    AgentNotConnected,

    #[error("send channel full")]
    SendChannelFull,

    #[error("probe timed out")]
    ProbeTimeout,

    #[error("probe failed: {0}")]
    ProbeFailed(String),

    #[error("invalid ip version")]
    InvalidIpVersion,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("transient cache failure: {0}")]
    TransientCacheFailure(String),

    #[error("persistent store failure: {0}")]
    PersistentStoreFailure(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { kind, id: id.into() }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
