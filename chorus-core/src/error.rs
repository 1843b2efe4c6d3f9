// ABOUTME: Typed error taxonomy for relay and orchestration failures.
// ABOUTME: Every variant is a rejected request or a logged no-op, never a process-level fault.

use thiserror::Error;

/// Errors surfaced by the broker, registry and orchestrator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    /// Unknown agent id or token mismatch
    #[error("unauthorized: {agent_id}")]
    Unauthorized { agent_id: String },

    /// Required field missing or malformed
    #[error("validation failed: {0}")]
    Validation(String),

    /// Message reached the hop limit and was dropped
    #[error("hop limit exceeded: hop count {hop_count} >= max {max_hops}")]
    HopLimitExceeded { hop_count: u32, max_hops: u32 },

    /// Best-effort delivery to a peer failed
    #[error("peer unreachable: {0}")]
    UnreachablePeer(String),

    /// A deferred action found its conversation already terminal
    #[error("scheduling: {0}")]
    Scheduling(String),
}

impl RelayError {
    pub fn unauthorized(agent_id: impl Into<String>) -> Self {
        Self::Unauthorized {
            agent_id: agent_id.into(),
        }
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation(reason.into())
    }

    /// Short label used for metrics and structured log fields
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unauthorized { .. } => "unauthorized",
            Self::Validation(_) => "validation",
            Self::HopLimitExceeded { .. } => "hop_limit",
            Self::UnreachablePeer(_) => "unreachable_peer",
            Self::Scheduling(_) => "scheduling",
        }
    }
}

pub type RelayResult<T> = std::result::Result<T, RelayError>;
