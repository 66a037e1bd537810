// =============================================================================
// Paper executor -- simulated fills against a persisted virtual balance
// =============================================================================
//
// Entry deducts notional plus the per-side fee from the tenant's balance;
// exit credits proceeds minus the fee. Realised PnL is the direction-signed
// price move minus both fees, so a same-price round trip nets exactly minus
// two fees.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::errors::{EngineError, Result};
use crate::storage::Storage;
use crate::types::{ExitReason, Position, PositionStatus, Side};

use super::{EntryRequest, OrderExecutor};

pub struct PaperExecutor {
    storage: Arc<dyn Storage>,
    starting_balance: f64,
    /// Fee per side as a percentage of notional.
    fee_pct: f64,
}

impl PaperExecutor {
    pub fn new(storage: Arc<dyn Storage>, starting_balance: f64, fee_pct: f64) -> Self {
        Self {
            storage,
            starting_balance,
            fee_pct,
        }
    }

    async fn balance(&self, tenant_id: &str) -> Result<f64> {
        Ok(self
            .storage
            .get_balance(tenant_id)
            .await?
            .unwrap_or(self.starting_balance))
    }

    fn fee(&self, notional: f64) -> f64 {
        notional.abs() * self.fee_pct / 100.0
    }
}

#[async_trait]
impl OrderExecutor for PaperExecutor {
    async fn enter_position(&self, request: EntryRequest) -> Result<Position> {
        // Replay: the key maps to the already-created position.
        if let Some(existing_id) = self
            .storage
            .get_idempotency(&request.idempotency_key)
            .await?
        {
            debug!(key = %request.idempotency_key, "entry replayed -- returning existing position");
            return self
                .storage
                .get_position(&existing_id)
                .await?
                .ok_or_else(|| {
                    EngineError::Invariant(format!(
                        "idempotency key '{}' points at missing position '{existing_id}'",
                        request.idempotency_key
                    ))
                });
        }

        if request.quantity <= 0.0 || request.reference_price <= 0.0 {
            return Err(EngineError::OrderRejected(format!(
                "invalid order: quantity {} at price {}",
                request.quantity, request.reference_price
            )));
        }

        let position = Position {
            id: Uuid::new_v4().to_string(),
            tenant_id: request.tenant_id.clone(),
            strategy_id: request.strategy_id,
            signal_id: request.signal_id,
            symbol: request.symbol,
            side: request.side,
            entry_price: request.reference_price,
            quantity: request.quantity,
            stop_loss: request.stop_loss,
            take_profit: request.take_profit,
            status: PositionStatus::Open,
            exit_price: None,
            exit_reason: None,
            realized_pnl: None,
            opened_at: Utc::now().timestamp_millis(),
            closed_at: None,
        };
        position
            .validate_bracket()
            .map_err(EngineError::OrderRejected)?;

        let notional = request.quantity * request.reference_price;
        let fee = self.fee(notional);
        let balance = self.balance(&request.tenant_id).await?;
        if balance < notional + fee {
            return Err(EngineError::OrderRejected(format!(
                "insufficient paper balance: {balance:.2} < {:.2}",
                notional + fee
            )));
        }

        self.storage
            .set_balance(&request.tenant_id, balance - notional - fee)
            .await?;
        self.storage.insert_position(&position).await?;
        self.storage
            .put_idempotency(&request.idempotency_key, &position.id)
            .await?;

        info!(
            id = %position.id,
            symbol = %position.symbol,
            side = %position.side,
            entry = position.entry_price,
            qty = position.quantity,
            "paper position opened"
        );
        Ok(position)
    }

    async fn exit_position(
        &self,
        position_id: &str,
        reason: ExitReason,
        reference_price: f64,
        idempotency_key: &str,
    ) -> Result<f64> {
        // Replay: the key maps to the recorded PnL.
        if let Some(recorded) = self.storage.get_idempotency(idempotency_key).await? {
            debug!(key = %idempotency_key, "exit replayed -- returning recorded pnl");
            return recorded.parse::<f64>().map_err(|_| {
                EngineError::Invariant(format!(
                    "idempotency key '{idempotency_key}' holds non-numeric pnl '{recorded}'"
                ))
            });
        }

        let position = self
            .storage
            .get_position(position_id)
            .await?
            .ok_or_else(|| EngineError::Storage(format!("position '{position_id}' not found")))?;

        // A direct (manual/admin) exit still goes through closing first.
        if position.status == PositionStatus::Open {
            self.storage
                .cas_position_status(position_id, PositionStatus::Open, PositionStatus::Closing)
                .await?;
        }

        let direction = match position.side {
            Side::Long => 1.0,
            Side::Short => -1.0,
        };
        let gross = direction * (reference_price - position.entry_price) * position.quantity;
        let entry_fee = self.fee(position.entry_price * position.quantity);
        let exit_fee = self.fee(reference_price * position.quantity);
        let pnl = gross - entry_fee - exit_fee;

        let finalized = self
            .storage
            .finalize_position(
                position_id,
                reference_price,
                reason,
                pnl,
                Utc::now().timestamp_millis(),
            )
            .await?;

        if !finalized {
            // Lost the race: someone else closed it; their pnl stands.
            let closed = self
                .storage
                .get_position(position_id)
                .await?
                .ok_or_else(|| {
                    EngineError::Storage(format!("position '{position_id}' vanished"))
                })?;
            let recorded = closed.realized_pnl.unwrap_or(0.0);
            self.storage
                .put_idempotency(idempotency_key, &recorded.to_string())
                .await?;
            return Ok(recorded);
        }

        // Credit proceeds minus the exit-side fee. The entry fee was charged
        // at entry time.
        let proceeds = reference_price * position.quantity;
        let balance = self.balance(&position.tenant_id).await?;
        self.storage
            .set_balance(&position.tenant_id, balance + proceeds - exit_fee)
            .await?;
        self.storage
            .put_idempotency(idempotency_key, &pnl.to_string())
            .await?;

        info!(
            id = %position_id,
            reason = %reason,
            exit = reference_price,
            pnl,
            "paper position closed"
        );
        Ok(pnl)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::exit_key;
    use crate::storage::MemoryStorage;

    fn executor(fee_pct: f64) -> (PaperExecutor, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        (
            PaperExecutor::new(storage.clone(), 10_000.0, fee_pct),
            storage,
        )
    }

    fn entry(symbol: &str, qty: f64, price: f64, key: &str) -> EntryRequest {
        EntryRequest {
            tenant_id: "t1".into(),
            strategy_id: "s1".into(),
            signal_id: None,
            symbol: symbol.into(),
            side: Side::Long,
            quantity: qty,
            reference_price: price,
            stop_loss: Some(price * 0.99),
            take_profit: Some(price * 1.02),
            idempotency_key: key.into(),
        }
    }

    #[tokio::test]
    async fn entry_deducts_balance() {
        let (exec, storage) = executor(0.0);
        let pos = exec
            .enter_position(entry("ETHUSDT", 1.0, 2_000.0, "k1"))
            .await
            .unwrap();
        assert_eq!(pos.status, PositionStatus::Open);
        assert_eq!(storage.get_balance("t1").await.unwrap(), Some(8_000.0));
    }

    #[tokio::test]
    async fn round_trip_at_same_price_costs_two_fees() {
        let (exec, storage) = executor(0.1);
        let pos = exec
            .enter_position(entry("ETHUSDT", 1.0, 2_000.0, "k1"))
            .await
            .unwrap();
        let pnl = exec
            .exit_position(&pos.id, ExitReason::Manual, 2_000.0, &exit_key(&pos.id))
            .await
            .unwrap();

        let fee = 2_000.0 * 0.1 / 100.0;
        assert!((pnl - (-2.0 * fee)).abs() < 1e-9, "pnl {pnl}");
        // Balance reflects the same two fees.
        let balance = storage.get_balance("t1").await.unwrap().unwrap();
        assert!((balance - (10_000.0 - 2.0 * fee)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn stop_loss_exit_pnl() {
        let (exec, _storage) = executor(0.0);
        let pos = exec
            .enter_position(entry("ETHUSDT", 1.0, 2_000.0, "k1"))
            .await
            .unwrap();
        let pnl = exec
            .exit_position(&pos.id, ExitReason::StopLoss, 1_989.0, &exit_key(&pos.id))
            .await
            .unwrap();
        assert!((pnl - (-11.0)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn short_pnl_is_negated() {
        let (exec, _storage) = executor(0.0);
        let mut req = entry("ETHUSDT", 2.0, 1_000.0, "k1");
        req.side = Side::Short;
        req.stop_loss = Some(1_010.0);
        req.take_profit = Some(980.0);
        let pos = exec.enter_position(req).await.unwrap();
        let pnl = exec
            .exit_position(&pos.id, ExitReason::TakeProfit, 980.0, &exit_key(&pos.id))
            .await
            .unwrap();
        assert!((pnl - 40.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn entry_replay_returns_same_position() {
        let (exec, storage) = executor(0.0);
        let a = exec
            .enter_position(entry("ETHUSDT", 1.0, 2_000.0, "same-key"))
            .await
            .unwrap();
        let b = exec
            .enter_position(entry("ETHUSDT", 1.0, 2_000.0, "same-key"))
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
        // Balance charged once.
        assert_eq!(storage.get_balance("t1").await.unwrap(), Some(8_000.0));
    }

    #[tokio::test]
    async fn exit_replay_returns_same_pnl() {
        let (exec, storage) = executor(0.0);
        let pos = exec
            .enter_position(entry("ETHUSDT", 1.0, 2_000.0, "k1"))
            .await
            .unwrap();
        let key = exit_key(&pos.id);
        let first = exec
            .exit_position(&pos.id, ExitReason::StopLoss, 1_989.0, &key)
            .await
            .unwrap();
        let second = exec
            .exit_position(&pos.id, ExitReason::StopLoss, 1_989.0, &key)
            .await
            .unwrap();
        assert_eq!(first, second);
        // Proceeds credited once.
        let balance = storage.get_balance("t1").await.unwrap().unwrap();
        assert!((balance - (10_000.0 - 11.0)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn insufficient_balance_is_terminal() {
        let (exec, _storage) = executor(0.0);
        let err = exec
            .enter_position(entry("BTCUSDT", 1.0, 50_000.0, "k1"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::OrderRejected(_)));
    }

    #[tokio::test]
    async fn invalid_bracket_is_rejected() {
        let (exec, _storage) = executor(0.0);
        let mut req = entry("ETHUSDT", 1.0, 2_000.0, "k1");
        req.stop_loss = Some(2_500.0); // long stop above entry
        let err = exec.enter_position(req).await.unwrap_err();
        assert!(matches!(err, EngineError::OrderRejected(_)));
    }
}
