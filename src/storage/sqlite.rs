// =============================================================================
// SQLite storage backend (embedded single-node store)
// =============================================================================
//
// Runtime-bound queries only; the schema is created on connect. CAS
// semantics ride on `UPDATE ... WHERE` guards with `rows_affected` deciding
// the winner, and signal dedup on the composite unique index.
// =============================================================================

use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::errors::{EngineError, Result};
use crate::types::{
    ExitReason, Position, PositionStatus, Signal, Side, SourceLabel, StrategyDef, StrategyState,
    TenantQuota,
};

use super::{SignalInsert, Storage};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS strategies (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        name TEXT NOT NULL,
        source TEXT NOT NULL,
        symbols TEXT NOT NULL,
        timeframes TEXT NOT NULL,
        signal_cap INTEGER NOT NULL,
        deadline_ms INTEGER NOT NULL,
        state TEXT NOT NULL,
        state_reason TEXT,
        error_count INTEGER NOT NULL DEFAULT 0,
        version INTEGER NOT NULL DEFAULT 1,
        last_eval_at INTEGER,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS quotas (
        tenant_id TEXT PRIMARY KEY,
        max_active_strategies INTEGER NOT NULL,
        max_concurrent_evals INTEGER NOT NULL,
        priority_class INTEGER NOT NULL,
        top_n INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS signals (
        id TEXT PRIMARY KEY,
        strategy_id TEXT NOT NULL,
        tenant_id TEXT NOT NULL,
        symbol TEXT NOT NULL,
        close_time INTEGER NOT NULL,
        price REAL NOT NULL,
        quote_volume REAL NOT NULL,
        source TEXT NOT NULL,
        metadata TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS signals_dedup
        ON signals (strategy_id, symbol, close_time)",
    "CREATE TABLE IF NOT EXISTS positions (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        strategy_id TEXT NOT NULL,
        signal_id TEXT,
        symbol TEXT NOT NULL,
        side TEXT NOT NULL,
        entry_price REAL NOT NULL,
        quantity REAL NOT NULL,
        stop_loss REAL,
        take_profit REAL,
        status TEXT NOT NULL,
        exit_price REAL,
        exit_reason TEXT,
        realized_pnl REAL,
        opened_at INTEGER NOT NULL,
        closed_at INTEGER
    )",
    "CREATE INDEX IF NOT EXISTS positions_status ON positions (status)",
    "CREATE TABLE IF NOT EXISTS balances (
        tenant_id TEXT PRIMARY KEY,
        balance REAL NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS idempotency (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
];

pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Connect and ensure the schema exists. `url` accepts `sqlite:` URLs and
    /// bare file paths.
    pub async fn connect(url: &str) -> Result<Self> {
        let normalized = if url.starts_with("sqlite:") {
            url.to_string()
        } else {
            format!("sqlite://{url}")
        };

        let opts = SqliteConnectOptions::from_str(&normalized)
            .map_err(|e| EngineError::Storage(format!("invalid storage url: {e}")))?
            .create_if_missing(true);

        // A shared in-memory database only exists per connection.
        let max_conns = if normalized.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_conns)
            .connect_with(opts)
            .await?;

        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&pool).await?;
        }

        info!(url = %normalized, "sqlite storage ready");
        Ok(Self { pool })
    }
}

fn row_to_strategy(row: &sqlx::sqlite::SqliteRow) -> Result<StrategyDef> {
    let state: String = row.try_get("state")?;
    let symbols: String = row.try_get("symbols")?;
    let timeframes: String = row.try_get("timeframes")?;
    Ok(StrategyDef {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        name: row.try_get("name")?,
        source: row.try_get("source")?,
        symbols: serde_json::from_str(&symbols)
            .map_err(|e| EngineError::Storage(format!("bad symbols column: {e}")))?,
        timeframes: serde_json::from_str(&timeframes)
            .map_err(|e| EngineError::Storage(format!("bad timeframes column: {e}")))?,
        signal_cap: row.try_get::<i64, _>("signal_cap")? as u32,
        deadline_ms: row.try_get::<i64, _>("deadline_ms")? as u64,
        state: state.parse().map_err(EngineError::Storage)?,
        state_reason: row.try_get("state_reason")?,
        error_count: row.try_get::<i64, _>("error_count")? as u32,
        version: row.try_get::<i64, _>("version")? as u64,
        last_eval_at: row.try_get("last_eval_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_position(row: &sqlx::sqlite::SqliteRow) -> Result<Position> {
    let side: String = row.try_get("side")?;
    let status: String = row.try_get("status")?;
    let exit_reason: Option<String> = row.try_get("exit_reason")?;
    Ok(Position {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        strategy_id: row.try_get("strategy_id")?,
        signal_id: row.try_get("signal_id")?,
        symbol: row.try_get("symbol")?,
        side: Side::from_str(&side).map_err(EngineError::Storage)?,
        entry_price: row.try_get("entry_price")?,
        quantity: row.try_get("quantity")?,
        stop_loss: row.try_get("stop_loss")?,
        take_profit: row.try_get("take_profit")?,
        status: status.parse().map_err(EngineError::Storage)?,
        exit_price: row.try_get("exit_price")?,
        exit_reason: exit_reason
            .map(|r| ExitReason::from_str(&r).map_err(EngineError::Storage))
            .transpose()?,
        realized_pnl: row.try_get("realized_pnl")?,
        opened_at: row.try_get("opened_at")?,
        closed_at: row.try_get("closed_at")?,
    })
}

fn row_to_signal(row: &sqlx::sqlite::SqliteRow) -> Result<Signal> {
    let source: String = row.try_get("source")?;
    let metadata: String = row.try_get("metadata")?;
    Ok(Signal {
        id: row.try_get("id")?,
        strategy_id: row.try_get("strategy_id")?,
        tenant_id: row.try_get("tenant_id")?,
        symbol: row.try_get("symbol")?,
        close_time: row.try_get("close_time")?,
        price: row.try_get("price")?,
        quote_volume: row.try_get("quote_volume")?,
        source: if source == "cloud" {
            SourceLabel::Cloud
        } else {
            SourceLabel::Local
        },
        metadata: serde_json::from_str(&metadata)
            .map_err(|e| EngineError::Storage(format!("bad metadata column: {e}")))?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn list_strategies(&self, tenant: Option<&str>) -> Result<Vec<StrategyDef>> {
        let rows = match tenant {
            Some(t) => {
                sqlx::query("SELECT * FROM strategies WHERE tenant_id = ? ORDER BY id")
                    .bind(t)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM strategies ORDER BY id")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(row_to_strategy).collect()
    }

    async fn get_quota(&self, tenant_id: &str) -> Result<TenantQuota> {
        let row = sqlx::query("SELECT * FROM quotas WHERE tenant_id = ?")
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(TenantQuota {
                tenant_id: row.try_get("tenant_id")?,
                max_active_strategies: row.try_get::<i64, _>("max_active_strategies")? as u32,
                max_concurrent_evals: row.try_get::<i64, _>("max_concurrent_evals")? as u32,
                priority_class: row.try_get::<i64, _>("priority_class")? as u8,
                top_n: row.try_get::<i64, _>("top_n")? as usize,
            }),
            None => Ok(TenantQuota {
                tenant_id: tenant_id.to_string(),
                ..TenantQuota::default()
            }),
        }
    }

    async fn put_quota(&self, quota: &TenantQuota) -> Result<()> {
        sqlx::query(
            "INSERT INTO quotas (tenant_id, max_active_strategies, max_concurrent_evals,
                                 priority_class, top_n)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(tenant_id) DO UPDATE SET
                 max_active_strategies = excluded.max_active_strategies,
                 max_concurrent_evals = excluded.max_concurrent_evals,
                 priority_class = excluded.priority_class,
                 top_n = excluded.top_n",
        )
        .bind(&quota.tenant_id)
        .bind(quota.max_active_strategies as i64)
        .bind(quota.max_concurrent_evals as i64)
        .bind(quota.priority_class as i64)
        .bind(quota.top_n as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn put_strategy(&self, def: &StrategyDef) -> Result<()> {
        let symbols = serde_json::to_string(&def.symbols)
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        let timeframes = serde_json::to_string(&def.timeframes)
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        sqlx::query(
            "INSERT INTO strategies (id, tenant_id, name, source, symbols, timeframes,
                                     signal_cap, deadline_ms, state, state_reason,
                                     error_count, version, last_eval_at, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 source = excluded.source,
                 symbols = excluded.symbols,
                 timeframes = excluded.timeframes,
                 signal_cap = excluded.signal_cap,
                 deadline_ms = excluded.deadline_ms,
                 state = excluded.state,
                 state_reason = excluded.state_reason,
                 error_count = excluded.error_count,
                 version = excluded.version,
                 updated_at = excluded.updated_at",
        )
        .bind(&def.id)
        .bind(&def.tenant_id)
        .bind(&def.name)
        .bind(&def.source)
        .bind(symbols)
        .bind(timeframes)
        .bind(def.signal_cap as i64)
        .bind(def.deadline_ms as i64)
        .bind(def.state.to_string())
        .bind(&def.state_reason)
        .bind(def.error_count as i64)
        .bind(def.version as i64)
        .bind(def.last_eval_at)
        .bind(def.created_at)
        .bind(def.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_strategy(&self, id: &str) -> Result<Option<StrategyDef>> {
        let row = sqlx::query("SELECT * FROM strategies WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_strategy).transpose()
    }

    async fn cas_strategy_state(
        &self,
        id: &str,
        expect_version: u64,
        new_state: StrategyState,
        error_count: u32,
        reason: Option<&str>,
    ) -> Result<bool> {
        let now = chrono::Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE strategies
             SET state = ?, error_count = ?, state_reason = ?,
                 version = version + 1, updated_at = ?
             WHERE id = ? AND version = ?",
        )
        .bind(new_state.to_string())
        .bind(error_count as i64)
        .bind(reason)
        .bind(now)
        .bind(id)
        .bind(expect_version as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn touch_strategy_eval(&self, id: &str, at: i64) -> Result<()> {
        sqlx::query("UPDATE strategies SET last_eval_at = ? WHERE id = ?")
            .bind(at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_signal(&self, signal: &Signal) -> Result<SignalInsert> {
        let metadata = serde_json::to_string(&signal.metadata)
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        let result = sqlx::query(
            "INSERT INTO signals (id, strategy_id, tenant_id, symbol, close_time,
                                  price, quote_volume, source, metadata, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(strategy_id, symbol, close_time) DO NOTHING",
        )
        .bind(&signal.id)
        .bind(&signal.strategy_id)
        .bind(&signal.tenant_id)
        .bind(&signal.symbol)
        .bind(signal.close_time)
        .bind(signal.price)
        .bind(signal.quote_volume)
        .bind(signal.source.to_string())
        .bind(metadata)
        .bind(signal.created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            Ok(SignalInsert::Created)
        } else {
            Ok(SignalInsert::AlreadyExists)
        }
    }

    async fn list_signals(&self, strategy_id: &str) -> Result<Vec<Signal>> {
        let rows =
            sqlx::query("SELECT * FROM signals WHERE strategy_id = ? ORDER BY close_time")
                .bind(strategy_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(row_to_signal).collect()
    }

    async fn insert_position(&self, position: &Position) -> Result<()> {
        sqlx::query(
            "INSERT INTO positions (id, tenant_id, strategy_id, signal_id, symbol, side,
                                    entry_price, quantity, stop_loss, take_profit, status,
                                    exit_price, exit_reason, realized_pnl, opened_at, closed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&position.id)
        .bind(&position.tenant_id)
        .bind(&position.strategy_id)
        .bind(&position.signal_id)
        .bind(&position.symbol)
        .bind(position.side.to_string())
        .bind(position.entry_price)
        .bind(position.quantity)
        .bind(position.stop_loss)
        .bind(position.take_profit)
        .bind(position.status.to_string())
        .bind(position.exit_price)
        .bind(position.exit_reason.map(|r| r.to_string()))
        .bind(position.realized_pnl)
        .bind(position.opened_at)
        .bind(position.closed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_position(&self, id: &str) -> Result<Option<Position>> {
        let row = sqlx::query("SELECT * FROM positions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_position).transpose()
    }

    async fn load_positions(&self, statuses: &[PositionStatus]) -> Result<Vec<Position>> {
        // Small, fixed status set; an IN clause built from placeholders.
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql =
            format!("SELECT * FROM positions WHERE status IN ({placeholders}) ORDER BY id");
        let mut query = sqlx::query(&sql);
        for s in statuses {
            query = query.bind(s.to_string());
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_position).collect()
    }

    async fn cas_position_status(
        &self,
        id: &str,
        from: PositionStatus,
        to: PositionStatus,
    ) -> Result<bool> {
        let result = sqlx::query("UPDATE positions SET status = ? WHERE id = ? AND status = ?")
            .bind(to.to_string())
            .bind(id)
            .bind(from.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn finalize_position(
        &self,
        id: &str,
        exit_price: f64,
        reason: ExitReason,
        realized_pnl: f64,
        closed_at: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE positions
             SET status = ?, exit_price = ?, exit_reason = ?, realized_pnl = ?, closed_at = ?
             WHERE id = ? AND status = ?",
        )
        .bind(PositionStatus::Closed.to_string())
        .bind(exit_price)
        .bind(reason.to_string())
        .bind(realized_pnl)
        .bind(closed_at)
        .bind(id)
        .bind(PositionStatus::Closing.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_balance(&self, tenant_id: &str) -> Result<Option<f64>> {
        let row = sqlx::query("SELECT balance FROM balances WHERE tenant_id = ?")
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => Some(row.try_get("balance")?),
            None => None,
        })
    }

    async fn set_balance(&self, tenant_id: &str, balance: f64) -> Result<()> {
        sqlx::query(
            "INSERT INTO balances (tenant_id, balance) VALUES (?, ?)
             ON CONFLICT(tenant_id) DO UPDATE SET balance = excluded.balance",
        )
        .bind(tenant_id)
        .bind(balance)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_idempotency(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM idempotency WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => Some(row.try_get("value")?),
            None => None,
        })
    }

    async fn put_idempotency(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO idempotency (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    async fn store() -> SqliteStorage {
        SqliteStorage::connect("sqlite::memory:").await.unwrap()
    }

    fn signal(close_time: i64) -> Signal {
        Signal {
            id: format!("sig-{close_time}"),
            strategy_id: "s1".into(),
            tenant_id: "t1".into(),
            symbol: "SOLUSDT".into(),
            close_time,
            price: 150.0,
            quote_volume: 2_000.0,
            source: SourceLabel::Local,
            metadata: HashMap::new(),
            created_at: 1,
        }
    }

    #[tokio::test]
    async fn signal_unique_constraint() {
        let store = store().await;
        assert_eq!(
            store.insert_signal(&signal(1_000)).await.unwrap(),
            SignalInsert::Created
        );
        // Same dedup key, different row id: the constraint absorbs it.
        let mut dup = signal(1_000);
        dup.id = "other-id".into();
        assert_eq!(
            store.insert_signal(&dup).await.unwrap(),
            SignalInsert::AlreadyExists
        );
        assert_eq!(store.list_signals("s1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn strategy_roundtrip_and_cas() {
        let store = store().await;
        let def = StrategyDef {
            id: "s1".into(),
            tenant_id: "t1".into(),
            name: "momo".into(),
            source: "return true".into(),
            symbols: vec!["BTCUSDT".into()],
            timeframes: vec!["5m".into()],
            signal_cap: 3,
            deadline_ms: 5_000,
            state: StrategyState::Stopped,
            state_reason: None,
            error_count: 0,
            version: 1,
            last_eval_at: None,
            created_at: 10,
            updated_at: 10,
        };
        store.put_strategy(&def).await.unwrap();

        let loaded = store.get_strategy("s1").await.unwrap().unwrap();
        assert_eq!(loaded.symbols, vec!["BTCUSDT"]);
        assert_eq!(loaded.state, StrategyState::Stopped);

        assert!(store
            .cas_strategy_state("s1", 1, StrategyState::Running, 0, None)
            .await
            .unwrap());
        assert!(!store
            .cas_strategy_state("s1", 1, StrategyState::Errored, 5, Some("stale"))
            .await
            .unwrap());

        let after = store.get_strategy("s1").await.unwrap().unwrap();
        assert_eq!(after.state, StrategyState::Running);
        assert_eq!(after.version, 2);
    }

    #[tokio::test]
    async fn position_cas_and_finalize() {
        let store = store().await;
        let pos = Position {
            id: "p1".into(),
            tenant_id: "t1".into(),
            strategy_id: "s1".into(),
            signal_id: Some("sig-1".into()),
            symbol: "ETHUSDT".into(),
            side: Side::Long,
            entry_price: 2_000.0,
            quantity: 1.0,
            stop_loss: Some(1_990.0),
            take_profit: Some(2_020.0),
            status: PositionStatus::Open,
            exit_price: None,
            exit_reason: None,
            realized_pnl: None,
            opened_at: 5,
            closed_at: None,
        };
        store.insert_position(&pos).await.unwrap();

        assert!(store
            .cas_position_status("p1", PositionStatus::Open, PositionStatus::Closing)
            .await
            .unwrap());
        assert!(!store
            .cas_position_status("p1", PositionStatus::Open, PositionStatus::Closing)
            .await
            .unwrap());
        assert!(store
            .finalize_position("p1", 1_989.0, ExitReason::StopLoss, -11.0, 99)
            .await
            .unwrap());

        let p = store.get_position("p1").await.unwrap().unwrap();
        assert_eq!(p.status, PositionStatus::Closed);
        assert_eq!(p.exit_reason, Some(ExitReason::StopLoss));
        assert_eq!(p.realized_pnl, Some(-11.0));

        let live = store
            .load_positions(&[PositionStatus::Open, PositionStatus::Closing])
            .await
            .unwrap();
        assert!(live.is_empty());
    }

    #[tokio::test]
    async fn balances_and_idempotency() {
        let store = store().await;
        assert_eq!(store.get_balance("t1").await.unwrap(), None);
        store.set_balance("t1", 10_000.0).await.unwrap();
        store.set_balance("t1", 9_500.0).await.unwrap();
        assert_eq!(store.get_balance("t1").await.unwrap(), Some(9_500.0));

        store.put_idempotency("k1", "done").await.unwrap();
        store.put_idempotency("k1", "again").await.unwrap();
        assert_eq!(
            store.get_idempotency("k1").await.unwrap(),
            Some("done".into())
        );
    }
}
