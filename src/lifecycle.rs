// =============================================================================
// Lifecycle Controller -- ordered startup, health, shutdown protocol
// =============================================================================
//
// Startup wires components in dependency order: storage, market store + hub,
// registry (loads and compiles all strategies), position monitor (recovers
// open/closing positions), executor, scheduler. A failure anywhere aborts
// startup before any background task is spawned, so there is nothing to
// unwind.
//
// Shutdown: (1) scheduler stops intake and in-flight evaluations drain,
// bounded; (2) the root cancellation signal stops the monitor, hub, registry
// and trackers; (3) remaining work is abandoned -- leases are process-local
// and positions stuck in closing recover on next start.
// =============================================================================

use std::sync::Arc;

use anyhow::Context;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bus::EventBus;
use crate::config::EngineConfig;
use crate::exchange::{ExchangeClient, RateLimiter};
use crate::executor::{OrderExecutor, PaperExecutor, RealExecutor};
use crate::market_data::{HubConfig, MarketDataHub, MarketStore, TopVolumeTracker};
use crate::monitor::PositionMonitor;
use crate::publisher::SignalPublisher;
use crate::registry::StrategyRegistry;
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::storage::{MemoryStorage, SqliteStorage, Storage};
use crate::types::SourceLabel;

/// Aggregated component health for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub ready: bool,
    pub hub_connected: bool,
    pub strategies_running: usize,
    pub evaluations_in_flight: usize,
    pub evaluations_skipped: u64,
    pub positions_tracked: usize,
    pub ticks_dropped: u64,
}

/// Backlog above which the engine reports not-ready.
const BACKLOG_NOT_READY: usize = 1_000;

pub struct Engine {
    pub cfg: EngineConfig,
    pub storage: Arc<dyn Storage>,
    pub hub: Arc<MarketDataHub>,
    pub registry: Arc<StrategyRegistry>,
    pub scheduler: Arc<Scheduler>,
    pub monitor: Arc<PositionMonitor>,
    pub top_volume: Arc<TopVolumeTracker>,
    pub bus: Arc<EventBus>,

    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Bring the engine up in dependency order. Any error aborts startup.
    pub async fn start(cfg: EngineConfig) -> anyhow::Result<Arc<Self>> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // -- 1. Storage ------------------------------------------------------
        let storage: Arc<dyn Storage> = if cfg.storage_url.is_empty()
            || cfg.storage_url == "memory:"
        {
            info!("using in-memory storage");
            Arc::new(MemoryStorage::new())
        } else {
            Arc::new(
                SqliteStorage::connect(&cfg.storage_url)
                    .await
                    .context("storage startup failed")?,
            )
        };

        // -- 2. Exchange client + market data hub ----------------------------
        let limits = Arc::new(RateLimiter::new());
        let client = Arc::new(ExchangeClient::new(
            cfg.api_key.clone(),
            cfg.api_secret.clone(),
            limits,
        ));
        let store = Arc::new(MarketStore::new(cfg.candle_history));
        let hub = Arc::new(MarketDataHub::new(
            store.clone(),
            client.clone(),
            HubConfig {
                channel_capacity: cfg.tick_channel_capacity,
                retry_capacity: 256,
                candle_history: cfg.candle_history,
                reconnect_cap_secs: cfg.reconnect_cap_secs,
            },
        ));

        // -- 3. Registry (loads strategies, compiles all) --------------------
        let tenant = (!cfg.user_id.is_empty()).then(|| cfg.user_id.clone());
        let registry = Arc::new(StrategyRegistry::new(storage.clone(), tenant));
        registry
            .reconcile()
            .await
            .context("strategy load failed")?;
        info!(strategies = registry.all().len(), "strategies loaded");

        // -- 4. Event bus + publisher ---------------------------------------
        let bus = Arc::new(EventBus::new(1_024));
        let publisher = Arc::new(SignalPublisher::new(
            storage.clone(),
            bus.clone(),
            SourceLabel::Local,
        ));

        // -- 5. Order executor ----------------------------------------------
        let executor: Arc<dyn OrderExecutor> = if cfg.paper_trading {
            info!(balance = cfg.paper_starting_balance, "paper executor selected");
            Arc::new(PaperExecutor::new(
                storage.clone(),
                cfg.paper_starting_balance,
                cfg.fee_pct,
            ))
        } else {
            if !client.has_credentials() {
                anyhow::bail!("real trading requires exchange credentials");
            }
            info!("real executor selected");
            Arc::new(RealExecutor::new(client.clone(), storage.clone()))
        };

        // -- 6. Position monitor (recovers open/closing positions) -----------
        let monitor = Arc::new(PositionMonitor::new(
            storage.clone(),
            executor,
            bus.clone(),
            cfg.monitor_shards,
        ));
        monitor
            .recover()
            .await
            .context("position recovery failed")?;

        // -- 7. Top-volume tracker + scheduler --------------------------------
        let top_volume = Arc::new(TopVolumeTracker::new());
        let scheduler = Arc::new(Scheduler::new(
            SchedulerConfig {
                global_eval_slots: cfg.global_eval_slots,
                admission_ceiling_ms: cfg.admission_ceiling_ms,
                error_threshold: cfg.error_threshold,
                candle_lookback: cfg.candle_history,
                deadline_ceiling_ms: cfg.deadline_ceiling_ms,
            },
            registry.clone(),
            store,
            publisher,
            storage.clone(),
            top_volume.clone(),
        ));

        let engine = Arc::new(Self {
            cfg,
            storage,
            hub,
            registry,
            scheduler,
            monitor,
            top_volume,
            bus,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        });

        engine.clone().spawn_tasks(client, shutdown_rx);
        info!("engine started");
        Ok(engine)
    }

    fn spawn_tasks(
        self: Arc<Self>,
        client: Arc<ExchangeClient>,
        shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut tasks = self.tasks.lock();

        // Initial subscriptions before the hub connects.
        self.refresh_subscriptions();

        // Hub consumers subscribe before the connection starts streaming.
        let ticks = self.hub.ticks("position-monitor");
        let closes = self.hub.candle_closes("scheduler");

        tasks.push(tokio::spawn(
            self.hub.clone().run(shutdown_rx.clone()),
        ));
        tasks.push(tokio::spawn(self.top_volume.clone().run(
            client,
            self.cfg.top_volume_poll_interval(),
            shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(self.registry.clone().run(
            std::time::Duration::from_secs(self.cfg.registry_poll_secs),
            shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(
            self.monitor.clone().run(ticks, shutdown_rx.clone()),
        ));
        tasks.push(tokio::spawn(
            self.scheduler.clone().run(closes, shutdown_rx.clone()),
        ));

        // Subscription refresh: registry changes and top-volume rotation feed
        // the hub's union of subscriptions.
        {
            let engine = self.clone();
            let mut sd = shutdown_rx;
            tasks.push(tokio::spawn(async move {
                let mut iv = tokio::time::interval(std::time::Duration::from_secs(30));
                loop {
                    tokio::select! {
                        _ = sd.changed() => return,
                        _ = iv.tick() => engine.refresh_subscriptions(),
                    }
                }
            }));
        }
    }

    /// Push the union of needed subscriptions into the hub: pinned symbols
    /// from running strategies, the top-volume set for followers, and any
    /// configured override universe.
    fn refresh_subscriptions(&self) {
        let (mut symbols, timeframes) = self.registry.subscription_needs();

        let follows_top = self
            .registry
            .running()
            .iter()
            .any(|s| s.def.follows_top_volume());
        if follows_top {
            symbols.extend(self.top_volume.top(self.cfg.default_top_n));
        }
        symbols.extend(self.cfg.symbols.iter().cloned());

        if !symbols.is_empty() && !timeframes.is_empty() {
            self.hub.subscribe_symbols(&symbols, &timeframes);
        }
    }

    // -------------------------------------------------------------------------
    // Health
    // -------------------------------------------------------------------------

    pub fn health(&self) -> Health {
        let in_flight = self.scheduler.in_flight();
        let hub_connected = self.hub.healthy();
        Health {
            ready: hub_connected && in_flight < BACKLOG_NOT_READY,
            hub_connected,
            strategies_running: self.registry.running().len(),
            evaluations_in_flight: in_flight,
            evaluations_skipped: self.scheduler.skipped(),
            positions_tracked: self.monitor.tracked_count(),
            ticks_dropped: self.hub.ticks_dropped(),
        }
    }

    // -------------------------------------------------------------------------
    // Shutdown
    // -------------------------------------------------------------------------

    /// Graceful shutdown inside the configured grace window.
    pub async fn shutdown(&self) {
        let grace = std::time::Duration::from_secs(self.cfg.shutdown_grace_secs);
        info!(grace_secs = grace.as_secs(), "shutdown initiated");

        // Phase 1: no new evaluations; drain in-flight, bounded.
        self.scheduler.stop_intake();
        let drain_budget = grace.min(std::time::Duration::from_secs(25));
        let drain_started = std::time::Instant::now();
        while self.scheduler.in_flight() > 0 && drain_started.elapsed() < drain_budget {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        if self.scheduler.in_flight() > 0 {
            warn!(
                remaining = self.scheduler.in_flight(),
                "abandoning in-flight evaluations"
            );
        }

        // Phase 2: root cancellation; monitor drains, hub disconnects,
        // loops stop.
        let _ = self.shutdown_tx.send(true);

        let mut tasks = Vec::new();
        std::mem::swap(&mut *self.tasks.lock(), &mut tasks);
        let deadline = grace.saturating_sub(drain_started.elapsed());
        let joins = async {
            for task in tasks {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(deadline, joins).await.is_err() {
            warn!("shutdown grace expired -- abandoning remaining tasks");
        }
        info!("engine stopped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{StrategyDef, StrategyState};

    fn local_cfg() -> EngineConfig {
        let mut cfg = EngineConfig::default();
        cfg.paper_trading = true;
        cfg.storage_url = "memory:".into();
        cfg
    }

    #[tokio::test]
    async fn engine_starts_and_stops_with_memory_storage() {
        let engine = Engine::start(local_cfg()).await.unwrap();
        let health = engine.health();
        assert_eq!(health.strategies_running, 0);
        assert_eq!(health.positions_tracked, 0);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn real_mode_without_credentials_aborts_startup() {
        let mut cfg = local_cfg();
        cfg.paper_trading = false;
        assert!(Engine::start(cfg).await.is_err());
    }

    #[tokio::test]
    async fn startup_compiles_preloaded_strategies() {
        let engine = Engine::start(local_cfg()).await.unwrap();
        engine
            .storage
            .put_strategy(&StrategyDef {
                id: "s1".into(),
                tenant_id: "t1".into(),
                name: "x".into(),
                source: "return true".into(),
                symbols: vec!["BTCUSDT".into()],
                timeframes: vec!["1m".into()],
                signal_cap: 10,
                deadline_ms: 5_000,
                state: StrategyState::Running,
                state_reason: None,
                error_count: 0,
                version: 1,
                last_eval_at: None,
                created_at: 0,
                updated_at: 0,
            })
            .await
            .unwrap();
        engine.registry.reconcile().await.unwrap();
        assert_eq!(engine.health().strategies_running, 1);
        engine.shutdown().await;
    }
}
