// =============================================================================
// Engine error taxonomy
// =============================================================================
//
// Kinds, not call sites: every fallible path in the engine maps its failure
// onto one of these variants so that retry / isolate / surface decisions can
// be made uniformly.
//
//   TransientExternal  -- retried with backoff, surfaced only when exhausted
//   PermanentExternal  -- component marked unhealthy, never retried
//   Strategy*          -- counted against the owning strategy only
//   Quota / Config     -- refused, surfaced to the control plane
//   Invariant          -- logged and failed, process keeps running
//   Fatal              -- process exits non-zero, supervisor restarts
// =============================================================================

use thiserror::Error;

/// Structured location-bearing compile failure for strategy source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    pub line: u32,
    pub col: u32,
    pub message: String,
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}: {}", self.line, self.col, self.message)
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// Network blip, exchange 5xx, rate-limit. Retryable.
    #[error("transient external failure: {0}")]
    TransientExternal(String),

    /// Auth failure, revoked key. Not retryable.
    #[error("permanent external failure: {0}")]
    PermanentExternal(String),

    /// Strategy source failed to compile.
    #[error("strategy compile error: {0}")]
    StrategyCompile(CompileError),

    /// Strategy evaluation exceeded its wall-clock deadline.
    #[error("strategy evaluation deadline exceeded after {0} ms")]
    StrategyDeadline(u64),

    /// Strategy evaluation panicked or aborted.
    #[error("strategy evaluation failed: {0}")]
    StrategyRuntime(String),

    /// Tenant quota refused the operation.
    #[error("tenant quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Invalid tenant-supplied configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An impossible state was reached. The affected request fails; the
    /// process does not.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// Storage contract failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Order was rejected by the exchange for a terminal reason.
    #[error("order rejected: {0}")]
    OrderRejected(String),

    /// Storage unreachable past the backoff ceiling, unrecoverable persisted
    /// state. Exits the process.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl EngineError {
    /// Whether bounded retry with backoff is appropriate.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientExternal(_))
    }

    /// Whether the failure is scoped to a single strategy.
    pub fn is_strategy_local(&self) -> bool {
        matches!(
            self,
            Self::StrategyCompile(_) | Self::StrategyDeadline(_) | Self::StrategyRuntime(_)
        )
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
