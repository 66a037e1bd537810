// =============================================================================
// Storage contract
// =============================================================================
//
// One capability interface over everything the engine persists. Storage is
// the ultimate serialisation point: strategy-state CAS (version column),
// signal deduplication (unique constraint), and position-status CAS are all
// enforced here, whatever the backend.
//
// Two implementations ship: an in-memory store for tests and local runs, and
// an embedded SQLite store for single-node deployments. A hosted relational
// backend sits behind the same trait.
// =============================================================================

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;

use crate::errors::Result;
use crate::types::{
    ExitReason, Position, PositionStatus, Signal, StrategyDef, StrategyState, TenantQuota,
};

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

/// Outcome of a conditional signal insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalInsert {
    Created,
    /// The (strategy, symbol, close-time) row already exists. Treated as
    /// success by the publisher: at-most-once under any retry.
    AlreadyExists,
}

#[async_trait]
pub trait Storage: Send + Sync {
    // -- configuration read ------------------------------------------------

    /// Active strategies for this process. `tenant` narrows to one tenant
    /// (single-tenant local mode); `None` returns every tenant's strategies.
    async fn list_strategies(&self, tenant: Option<&str>) -> Result<Vec<StrategyDef>>;

    /// Quota for one tenant; defaults apply when none is stored.
    async fn get_quota(&self, tenant_id: &str) -> Result<TenantQuota>;

    /// Upsert a quota record (admin path).
    async fn put_quota(&self, quota: &TenantQuota) -> Result<()>;

    // -- strategy state (CAS on version) -----------------------------------

    /// Create or replace a strategy definition (admin path).
    async fn put_strategy(&self, def: &StrategyDef) -> Result<()>;

    async fn get_strategy(&self, id: &str) -> Result<Option<StrategyDef>>;

    /// Compare-and-swap the strategy state. Succeeds only when the stored
    /// version equals `expect_version`; the winner's write bumps the version.
    async fn cas_strategy_state(
        &self,
        id: &str,
        expect_version: u64,
        new_state: StrategyState,
        error_count: u32,
        reason: Option<&str>,
    ) -> Result<bool>;

    /// Record the time of the latest evaluation (no version bump).
    async fn touch_strategy_eval(&self, id: &str, at: i64) -> Result<()>;

    // -- signals -----------------------------------------------------------

    /// Conditional insert keyed on (strategy_id, symbol, close_time).
    async fn insert_signal(&self, signal: &Signal) -> Result<SignalInsert>;

    async fn list_signals(&self, strategy_id: &str) -> Result<Vec<Signal>>;

    // -- positions ---------------------------------------------------------

    async fn insert_position(&self, position: &Position) -> Result<()>;

    async fn get_position(&self, id: &str) -> Result<Option<Position>>;

    /// Positions currently in any of `statuses` (crash recovery, monitor
    /// warm-up).
    async fn load_positions(&self, statuses: &[PositionStatus]) -> Result<Vec<Position>>;

    /// CAS `from -> to` on the status column. Exactly one concurrent caller
    /// wins.
    async fn cas_position_status(
        &self,
        id: &str,
        from: PositionStatus,
        to: PositionStatus,
    ) -> Result<bool>;

    /// Complete a close: `closing -> closed` plus exit bookkeeping, in one
    /// write.
    async fn finalize_position(
        &self,
        id: &str,
        exit_price: f64,
        reason: ExitReason,
        realized_pnl: f64,
        closed_at: i64,
    ) -> Result<bool>;

    // -- paper balances ----------------------------------------------------

    async fn get_balance(&self, tenant_id: &str) -> Result<Option<f64>>;

    async fn set_balance(&self, tenant_id: &str, balance: f64) -> Result<()>;

    // -- idempotency -------------------------------------------------------

    /// Look up the recorded outcome for an idempotency key.
    async fn get_idempotency(&self, key: &str) -> Result<Option<String>>;

    /// Record the outcome for an idempotency key (first writer wins).
    async fn put_idempotency(&self, key: &str, value: &str) -> Result<()>;
}
