// =============================================================================
// In-memory storage backend
// =============================================================================
//
// Backs tests and local single-tenant runs. All contract semantics (version
// CAS, unique signal constraint, status CAS, idempotency first-writer-wins)
// are implemented exactly as the SQLite backend does them, just under one
// mutex instead of a database engine.
// =============================================================================

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::errors::{EngineError, Result};
use crate::types::{
    ExitReason, Position, PositionStatus, Signal, StrategyDef, StrategyState, TenantQuota,
};

use super::{SignalInsert, Storage};

#[derive(Default)]
struct Inner {
    strategies: HashMap<String, StrategyDef>,
    quotas: HashMap<String, TenantQuota>,
    signals: Vec<Signal>,
    signal_keys: HashSet<(String, String, i64)>,
    positions: HashMap<String, Position>,
    balances: HashMap<String, f64>,
    idempotency: HashMap<String, String>,
}

#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn list_strategies(&self, tenant: Option<&str>) -> Result<Vec<StrategyDef>> {
        let inner = self.inner.lock();
        let mut out: Vec<StrategyDef> = inner
            .strategies
            .values()
            .filter(|s| tenant.map_or(true, |t| s.tenant_id == t))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn get_quota(&self, tenant_id: &str) -> Result<TenantQuota> {
        let inner = self.inner.lock();
        Ok(inner.quotas.get(tenant_id).cloned().unwrap_or_else(|| {
            TenantQuota {
                tenant_id: tenant_id.to_string(),
                ..TenantQuota::default()
            }
        }))
    }

    async fn put_quota(&self, quota: &TenantQuota) -> Result<()> {
        self.inner
            .lock()
            .quotas
            .insert(quota.tenant_id.clone(), quota.clone());
        Ok(())
    }

    async fn put_strategy(&self, def: &StrategyDef) -> Result<()> {
        self.inner
            .lock()
            .strategies
            .insert(def.id.clone(), def.clone());
        Ok(())
    }

    async fn get_strategy(&self, id: &str) -> Result<Option<StrategyDef>> {
        Ok(self.inner.lock().strategies.get(id).cloned())
    }

    async fn cas_strategy_state(
        &self,
        id: &str,
        expect_version: u64,
        new_state: StrategyState,
        error_count: u32,
        reason: Option<&str>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        let def = inner
            .strategies
            .get_mut(id)
            .ok_or_else(|| EngineError::Storage(format!("strategy '{id}' not found")))?;
        if def.version != expect_version {
            return Ok(false);
        }
        def.state = new_state;
        def.error_count = error_count;
        def.state_reason = reason.map(str::to_string);
        def.version += 1;
        Ok(true)
    }

    async fn touch_strategy_eval(&self, id: &str, at: i64) -> Result<()> {
        if let Some(def) = self.inner.lock().strategies.get_mut(id) {
            def.last_eval_at = Some(at);
        }
        Ok(())
    }

    async fn insert_signal(&self, signal: &Signal) -> Result<SignalInsert> {
        let mut inner = self.inner.lock();
        let key = (
            signal.strategy_id.clone(),
            signal.symbol.clone(),
            signal.close_time,
        );
        if !inner.signal_keys.insert(key) {
            return Ok(SignalInsert::AlreadyExists);
        }
        inner.signals.push(signal.clone());
        Ok(SignalInsert::Created)
    }

    async fn list_signals(&self, strategy_id: &str) -> Result<Vec<Signal>> {
        let inner = self.inner.lock();
        let mut out: Vec<Signal> = inner
            .signals
            .iter()
            .filter(|s| s.strategy_id == strategy_id)
            .cloned()
            .collect();
        out.sort_by_key(|s| s.close_time);
        Ok(out)
    }

    async fn insert_position(&self, position: &Position) -> Result<()> {
        self.inner
            .lock()
            .positions
            .insert(position.id.clone(), position.clone());
        Ok(())
    }

    async fn get_position(&self, id: &str) -> Result<Option<Position>> {
        Ok(self.inner.lock().positions.get(id).cloned())
    }

    async fn load_positions(&self, statuses: &[PositionStatus]) -> Result<Vec<Position>> {
        let inner = self.inner.lock();
        let mut out: Vec<Position> = inner
            .positions
            .values()
            .filter(|p| statuses.contains(&p.status))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn cas_position_status(
        &self,
        id: &str,
        from: PositionStatus,
        to: PositionStatus,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.positions.get_mut(id) {
            Some(p) if p.status == from => {
                p.status = to;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(EngineError::Storage(format!("position '{id}' not found"))),
        }
    }

    async fn finalize_position(
        &self,
        id: &str,
        exit_price: f64,
        reason: ExitReason,
        realized_pnl: f64,
        closed_at: i64,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.positions.get_mut(id) {
            Some(p) if p.status == PositionStatus::Closing => {
                p.status = PositionStatus::Closed;
                p.exit_price = Some(exit_price);
                p.exit_reason = Some(reason);
                p.realized_pnl = Some(realized_pnl);
                p.closed_at = Some(closed_at);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(EngineError::Storage(format!("position '{id}' not found"))),
        }
    }

    async fn get_balance(&self, tenant_id: &str) -> Result<Option<f64>> {
        Ok(self.inner.lock().balances.get(tenant_id).copied())
    }

    async fn set_balance(&self, tenant_id: &str, balance: f64) -> Result<()> {
        self.inner
            .lock()
            .balances
            .insert(tenant_id.to_string(), balance);
        Ok(())
    }

    async fn get_idempotency(&self, key: &str) -> Result<Option<String>> {
        Ok(self.inner.lock().idempotency.get(key).cloned())
    }

    async fn put_idempotency(&self, key: &str, value: &str) -> Result<()> {
        self.inner
            .lock()
            .idempotency
            .entry(key.to_string())
            .or_insert_with(|| value.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
