// =============================================================================
// Position Monitor -- reacts to every tick for every open position
// =============================================================================
//
// Lookup path is a symbol -> open-position-id index; reads dominate, so the
// index lives behind a RwLock and ticks are fanned across symbol-hash shards
// to keep latency flat at high tick rates.
//
// Exit discipline: crossing a stop or target first CAS-es the position status
// open -> closing in storage. Exactly one observer wins that transition; only
// the winner invokes the Exit Executor, so two consecutive crossing ticks can
// never double-exit. The exit uses a deterministic idempotency key, which
// also makes the crash-recovery retry for positions found in `closing` safe.
// =============================================================================

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::bus::EventBus;
use crate::errors::Result;
use crate::executor::{exit_key, OrderExecutor};
use crate::storage::Storage;
use crate::types::{ExitReason, Position, PositionStatus, Side, Ticker};

/// Interval of the closing-position retry sweep.
const RETRY_SWEEP_SECS: u64 = 30;

pub struct PositionMonitor {
    storage: Arc<dyn Storage>,
    executor: Arc<dyn OrderExecutor>,
    bus: Arc<EventBus>,
    /// symbol -> ids of positions currently monitored.
    index: RwLock<HashMap<String, HashSet<String>>>,
    /// Local cache of monitored positions (open or closing).
    positions: RwLock<HashMap<String, Position>>,
    shards: usize,
}

/// SL/TP crossing check.
fn crossed(position: &Position, price: f64) -> Option<ExitReason> {
    match position.side {
        Side::Long => {
            if position.stop_loss.is_some_and(|sl| price <= sl) {
                Some(ExitReason::StopLoss)
            } else if position.take_profit.is_some_and(|tp| price >= tp) {
                Some(ExitReason::TakeProfit)
            } else {
                None
            }
        }
        Side::Short => {
            if position.stop_loss.is_some_and(|sl| price >= sl) {
                Some(ExitReason::StopLoss)
            } else if position.take_profit.is_some_and(|tp| price <= tp) {
                Some(ExitReason::TakeProfit)
            } else {
                None
            }
        }
    }
}

impl PositionMonitor {
    pub fn new(
        storage: Arc<dyn Storage>,
        executor: Arc<dyn OrderExecutor>,
        bus: Arc<EventBus>,
        shards: usize,
    ) -> Self {
        Self {
            storage,
            executor,
            bus,
            index: RwLock::new(HashMap::new()),
            positions: RwLock::new(HashMap::new()),
            shards: shards.max(1),
        }
    }

    // -------------------------------------------------------------------------
    // Tracking
    // -------------------------------------------------------------------------

    /// Begin monitoring a freshly opened position.
    pub fn track(&self, position: Position) {
        debug!(id = %position.id, symbol = %position.symbol, "monitoring position");
        self.index
            .write()
            .entry(position.symbol.clone())
            .or_default()
            .insert(position.id.clone());
        self.bus.publish_position(position.clone());
        self.positions.write().insert(position.id.clone(), position);
    }

    fn untrack(&self, id: &str, symbol: &str) {
        let mut index = self.index.write();
        if let Some(set) = index.get_mut(symbol) {
            set.remove(id);
            if set.is_empty() {
                index.remove(symbol);
            }
        }
        self.positions.write().remove(id);
    }

    /// Number of positions currently monitored.
    pub fn tracked_count(&self) -> usize {
        self.positions.read().len()
    }

    // -------------------------------------------------------------------------
    // Recovery
    // -------------------------------------------------------------------------

    /// Load open and closing positions from storage. A `closing` position is
    /// a crash mid-exit; its exit is retried with the original key.
    pub async fn recover(&self) -> Result<()> {
        let live = self
            .storage
            .load_positions(&[PositionStatus::Open, PositionStatus::Closing])
            .await?;
        info!(count = live.len(), "recovering positions");

        for position in live {
            let retry = position.status == PositionStatus::Closing;
            self.index
                .write()
                .entry(position.symbol.clone())
                .or_default()
                .insert(position.id.clone());
            self.positions
                .write()
                .insert(position.id.clone(), position.clone());

            if retry {
                warn!(id = %position.id, "position stuck in closing -- retrying exit");
                self.complete_exit(&position, ExitReason::StopLoss, position.entry_price)
                    .await;
            }
        }
        Ok(())
    }

    /// Periodic sweep retrying exits for positions stuck in `closing`.
    async fn retry_closing(&self) {
        let stuck: Vec<Position> = {
            let positions = self.positions.read();
            positions
                .values()
                .filter(|p| p.status == PositionStatus::Closing)
                .cloned()
                .collect()
        };
        for position in stuck {
            warn!(id = %position.id, "retrying exit for closing position");
            let reason = position.exit_reason.unwrap_or(ExitReason::StopLoss);
            let price = position.exit_price.unwrap_or(position.entry_price);
            self.complete_exit(&position, reason, price).await;
        }
    }

    // -------------------------------------------------------------------------
    // Tick path
    // -------------------------------------------------------------------------

    /// Evaluate every monitored position on `symbol` against `price`.
    pub async fn on_tick(&self, symbol: &str, price: f64) {
        if price <= 0.0 {
            return;
        }

        let candidates: Vec<Position> = {
            let index = self.index.read();
            let Some(ids) = index.get(symbol) else {
                return;
            };
            let positions = self.positions.read();
            ids.iter()
                .filter_map(|id| positions.get(id))
                .filter(|p| p.status == PositionStatus::Open)
                .cloned()
                .collect()
        };

        for position in candidates {
            let Some(reason) = crossed(&position, price) else {
                continue;
            };

            // Single-winner transition; the loser observes status != open and
            // does nothing.
            match self
                .storage
                .cas_position_status(&position.id, PositionStatus::Open, PositionStatus::Closing)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    debug!(id = %position.id, "exit race lost -- already closing");
                    continue;
                }
                Err(e) => {
                    error!(id = %position.id, error = %e, "status CAS failed");
                    continue;
                }
            }

            if let Some(p) = self.positions.write().get_mut(&position.id) {
                p.status = PositionStatus::Closing;
            }
            info!(
                id = %position.id,
                symbol = %position.symbol,
                side = %position.side,
                price,
                reason = %reason,
                "exit threshold crossed"
            );
            self.complete_exit(&position, reason, price).await;
        }
    }

    /// Invoke the Exit Executor and finish local bookkeeping. Failures leave
    /// the position in `closing` for the retry sweep.
    async fn complete_exit(&self, position: &Position, reason: ExitReason, price: f64) {
        let key = exit_key(&position.id);
        match self
            .executor
            .exit_position(&position.id, reason, price, &key)
            .await
        {
            Ok(pnl) => {
                self.untrack(&position.id, &position.symbol);
                match self.storage.get_position(&position.id).await {
                    Ok(Some(closed)) => self.bus.publish_position(closed),
                    Ok(None) => {
                        error!(id = %position.id, "closed position missing from storage")
                    }
                    Err(e) => warn!(id = %position.id, error = %e, "could not reload closed position"),
                }
                info!(id = %position.id, pnl, reason = %reason, "position exit complete");
            }
            Err(e) if e.is_transient() => {
                warn!(id = %position.id, error = %e, "exit attempt failed -- will retry");
            }
            Err(e) => {
                error!(id = %position.id, error = %e, "exit failed terminally");
                // Terminal failures still leave the record in closing;
                // operator action (or the sweep, for liquidations resolved
                // upstream) finishes the story.
            }
        }
    }

    // -------------------------------------------------------------------------
    // Run loop
    // -------------------------------------------------------------------------

    /// Consume the hub tick stream, sharded by symbol hash.
    pub async fn run(
        self: Arc<Self>,
        mut ticks: mpsc::Receiver<Ticker>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut workers: Vec<mpsc::Sender<Ticker>> = Vec::with_capacity(self.shards);
        for shard in 0..self.shards {
            let (tx, mut rx) = mpsc::channel::<Ticker>(1_024);
            workers.push(tx);
            let monitor = self.clone();
            let mut sd = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = sd.changed() => return,
                        tick = rx.recv() => match tick {
                            Some(t) => monitor.on_tick(&t.symbol, t.last_price).await,
                            None => return,
                        }
                    }
                }
            });
            debug!(shard, "monitor shard started");
        }

        // Closing-position retry sweep.
        {
            let monitor = self.clone();
            let mut sd = shutdown.clone();
            tokio::spawn(async move {
                let mut iv =
                    tokio::time::interval(std::time::Duration::from_secs(RETRY_SWEEP_SECS));
                loop {
                    tokio::select! {
                        _ = sd.changed() => return,
                        _ = iv.tick() => monitor.retry_closing().await,
                    }
                }
            });
        }

        info!(shards = self.shards, "position monitor running");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("position monitor stopping");
                    return;
                }
                tick = ticks.recv() => match tick {
                    Some(t) => {
                        let mut hasher = DefaultHasher::new();
                        t.symbol.hash(&mut hasher);
                        let shard = (hasher.finish() as usize) % self.shards;
                        // Per-shard channel full means that shard is behind;
                        // dropping a tick is acceptable (they are continuous).
                        let _ = workers[shard].try_send(t);
                    }
                    None => {
                        warn!("tick stream ended");
                        return;
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
