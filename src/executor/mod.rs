// =============================================================================
// Order Executor -- abstract entry/exit contract
// =============================================================================
//
// Both backends (paper, real) produce the same Position record shape and are
// idempotency-keyed: replaying an entry or exit with the same key returns the
// already-recorded outcome instead of acting twice. That makes the monitor's
// crash-recovery retry safe.
// =============================================================================

pub mod paper;
pub mod real;

use async_trait::async_trait;

use crate::errors::Result;
use crate::types::{ExitReason, Position, Side};

pub use paper::PaperExecutor;
pub use real::RealExecutor;

/// Everything needed to open a position.
#[derive(Debug, Clone)]
pub struct EntryRequest {
    pub tenant_id: String,
    pub strategy_id: String,
    pub signal_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    /// Price the caller observed when deciding to enter; paper fills at this
    /// price, real orders fill at the exchange's price.
    pub reference_price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    /// Retry-safe entry key.
    pub idempotency_key: String,
}

#[async_trait]
pub trait OrderExecutor: Send + Sync {
    /// Atomically open a position. A replayed idempotency key returns the
    /// originally created position.
    async fn enter_position(&self, request: EntryRequest) -> Result<Position>;

    /// Atomically close a position and return the realised PnL. A replayed
    /// idempotency key returns the originally recorded PnL.
    async fn exit_position(
        &self,
        position_id: &str,
        reason: ExitReason,
        reference_price: f64,
        idempotency_key: &str,
    ) -> Result<f64>;
}

/// Deterministic exit key so crash-recovery retries collapse onto the first
/// attempt.
pub fn exit_key(position_id: &str) -> String {
    format!("exit-{position_id}")
}
