// =============================================================================
// Scheduler -- fires strategy evaluations on candle closes
// =============================================================================
//
// One global subscription to the hub's candle-close stream drives everything.
// Per event, candidates are the running strategies whose primary timeframe
// and symbol set match; admission takes the global semaphore then the
// per-tenant semaphore, in tenant-priority order, bounded by the per-tick
// ceiling. Blocked-past-ceiling means skip, never queue: the next candle
// close re-drives evaluation.
//
// Fairness: candidates are admitted in priority-class order, and every
// tenant owns one reserved slot outside the global cap, so a tenant with at
// least one running strategy is never starved by global load.
// =============================================================================

pub mod lease;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, error, info, warn};

use crate::errors::{EngineError, Result};
use crate::market_data::{CloseEvent, MarketStore, TopVolumeTracker};
use crate::publisher::SignalPublisher;
use crate::registry::{ActiveStrategy, StrategyRegistry};
use crate::sandbox::Sandbox;
use crate::storage::Storage;
use crate::types::{Candle, SeriesKey, StrategyState, TenantQuota};

use lease::LeaseTable;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub global_eval_slots: usize,
    pub admission_ceiling_ms: u64,
    pub error_threshold: u32,
    pub candle_lookback: usize,
    pub deadline_ceiling_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            global_eval_slots: 500,
            admission_ceiling_ms: 1_000,
            error_threshold: 5,
            candle_lookback: 300,
            deadline_ceiling_ms: 30_000,
        }
    }
}

pub struct Scheduler {
    cfg: SchedulerConfig,
    registry: Arc<StrategyRegistry>,
    snapshot: Arc<MarketStore>,
    sandbox: Sandbox,
    publisher: Arc<SignalPublisher>,
    storage: Arc<dyn Storage>,
    top_volume: Arc<TopVolumeTracker>,

    leases: LeaseTable,
    global_slots: Arc<Semaphore>,
    tenant_slots: Mutex<HashMap<String, (u32, Arc<Semaphore>)>>,
    reserved_slots: Mutex<HashMap<String, Arc<Semaphore>>>,

    /// Per (strategy, close-time) forwarded-match counter for the signal cap.
    tick_matches: Mutex<HashMap<(String, i64), u32>>,

    intake_enabled: AtomicBool,
    in_flight: Arc<AtomicUsize>,
    skipped: AtomicU64,
}

impl Scheduler {
    pub fn new(
        cfg: SchedulerConfig,
        registry: Arc<StrategyRegistry>,
        snapshot: Arc<MarketStore>,
        publisher: Arc<SignalPublisher>,
        storage: Arc<dyn Storage>,
        top_volume: Arc<TopVolumeTracker>,
    ) -> Self {
        let sandbox = Sandbox {
            deadline_ceiling_ms: cfg.deadline_ceiling_ms,
            cancel_grace_ms: 100,
        };
        Self {
            global_slots: Arc::new(Semaphore::new(cfg.global_eval_slots)),
            cfg,
            registry,
            snapshot,
            sandbox,
            publisher,
            storage,
            top_volume,
            leases: LeaseTable::new(),
            tenant_slots: Mutex::new(HashMap::new()),
            reserved_slots: Mutex::new(HashMap::new()),
            tick_matches: Mutex::new(HashMap::new()),
            intake_enabled: AtomicBool::new(true),
            in_flight: Arc::new(AtomicUsize::new(0)),
            skipped: AtomicU64::new(0),
        }
    }

    // -------------------------------------------------------------------------
    // Observability
    // -------------------------------------------------------------------------

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    /// Stop admitting new evaluations (shutdown phase 1).
    pub fn stop_intake(&self) {
        self.intake_enabled.store(false, Ordering::Relaxed);
    }

    // -------------------------------------------------------------------------
    // Admin state machine
    // -------------------------------------------------------------------------

    /// Admin start: quota check then stopped/errored -> starting. The
    /// registry's next reconcile pass compiles and promotes to running.
    pub async fn start_strategy(&self, id: &str) -> Result<()> {
        let def = self
            .storage
            .get_strategy(id)
            .await?
            .ok_or_else(|| EngineError::Storage(format!("strategy '{id}' not found")))?;

        if !matches!(def.state, StrategyState::Stopped | StrategyState::Errored) {
            return Err(EngineError::Config(format!(
                "strategy '{id}' is {}; only stopped or errored strategies can start",
                def.state
            )));
        }

        let quota = self.storage.get_quota(&def.tenant_id).await?;
        let active = self
            .storage
            .list_strategies(Some(&def.tenant_id))
            .await?
            .into_iter()
            .filter(|s| matches!(s.state, StrategyState::Starting | StrategyState::Running))
            .count() as u32;
        if active >= quota.max_active_strategies {
            return Err(EngineError::QuotaExceeded(format!(
                "tenant '{}' already runs {active} of {} allowed strategies",
                def.tenant_id, quota.max_active_strategies
            )));
        }

        if !self
            .storage
            .cas_strategy_state(id, def.version, StrategyState::Starting, 0, None)
            .await?
        {
            return Err(EngineError::TransientExternal(format!(
                "strategy '{id}' changed concurrently; retry"
            )));
        }
        self.registry.reconcile().await?;
        info!(id, "strategy starting");
        Ok(())
    }

    /// Admin stop from any state.
    pub async fn stop_strategy(&self, id: &str) -> Result<()> {
        let def = self
            .storage
            .get_strategy(id)
            .await?
            .ok_or_else(|| EngineError::Storage(format!("strategy '{id}' not found")))?;
        if def.state == StrategyState::Stopped {
            return Ok(());
        }
        if !self
            .storage
            .cas_strategy_state(id, def.version, StrategyState::Stopped, def.error_count, None)
            .await?
        {
            return Err(EngineError::TransientExternal(format!(
                "strategy '{id}' changed concurrently; retry"
            )));
        }
        self.registry.reconcile().await?;
        info!(id, "strategy stopped");
        Ok(())
    }

    /// Emergency halt: every running strategy to stopped.
    pub async fn emergency_halt(&self) -> Result<usize> {
        let mut halted = 0;
        for active in self.registry.running() {
            if self.stop_strategy(&active.def.id).await.is_ok() {
                halted += 1;
            }
        }
        warn!(halted, "emergency halt executed");
        Ok(halted)
    }

    // -------------------------------------------------------------------------
    // Candle-close handling
    // -------------------------------------------------------------------------

    async fn handle_close(self: Arc<Self>, key: &SeriesKey, candle: &Candle) {
        if !self.intake_enabled.load(Ordering::Relaxed) {
            return;
        }
        let received_at = std::time::Instant::now();

        // Candidate selection, then priority ordering.
        let mut candidates: Vec<(ActiveStrategy, TenantQuota)> = Vec::new();
        for active in self.registry.running() {
            if active.def.primary_timeframe() != key.timeframe {
                continue;
            }
            let quota = match self.storage.get_quota(&active.def.tenant_id).await {
                Ok(q) => q,
                Err(e) => {
                    warn!(tenant = %active.def.tenant_id, error = %e, "quota read failed");
                    continue;
                }
            };
            let symbol_matches = if active.def.follows_top_volume() {
                self.top_volume.contains(&key.symbol, quota.top_n)
            } else {
                active.def.symbols.iter().any(|s| s == &key.symbol)
            };
            if symbol_matches {
                candidates.push((active, quota));
            }
        }
        if candidates.is_empty() {
            return;
        }

        candidates.sort_by(|a, b| {
            b.1.priority_class
                .cmp(&a.1.priority_class)
                .then_with(|| a.0.def.id.cmp(&b.0.def.id))
        });

        debug!(
            series = %key,
            close_time = candle.close_time,
            candidates = candidates.len(),
            "candle close -- scheduling evaluations"
        );

        for (active, quota) in candidates {
            self.clone()
                .admit_and_spawn(active, quota, key, candle, received_at)
                .await;
        }
    }

    /// Two-stage admission (global then tenant), bounded by the per-tick
    /// ceiling, then lease acquisition and task spawn.
    async fn admit_and_spawn(
        self: Arc<Self>,
        active: ActiveStrategy,
        quota: TenantQuota,
        key: &SeriesKey,
        candle: &Candle,
        received_at: std::time::Instant,
    ) {
        let ceiling = std::time::Duration::from_millis(self.cfg.admission_ceiling_ms);
        let tenant_id = active.def.tenant_id.clone();

        let remaining = ceiling.saturating_sub(received_at.elapsed());

        // Global slot, falling back to the tenant's reserved slot, falling
        // back to waiting out the remaining ceiling.
        let global_permit = match self.global_slots.clone().try_acquire_owned() {
            Ok(p) => Some(p),
            Err(_) => match self.reserved_slot(&tenant_id).try_acquire_owned() {
                Ok(p) => Some(p),
                Err(_) => {
                    match tokio::time::timeout(
                        remaining,
                        self.global_slots.clone().acquire_owned(),
                    )
                    .await
                    {
                        Ok(Ok(p)) => Some(p),
                        _ => None,
                    }
                }
            },
        };
        let Some(global_permit) = global_permit else {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            debug!(strategy = %active.def.id, symbol = %key.symbol, "admission ceiling hit -- skipping tick");
            return;
        };

        let tenant_sem = self.tenant_slot(&tenant_id, quota.max_concurrent_evals);
        let remaining = ceiling.saturating_sub(received_at.elapsed());
        let tenant_permit = match tenant_sem.clone().try_acquire_owned() {
            Ok(p) => Some(p),
            Err(_) => match tokio::time::timeout(remaining, tenant_sem.acquire_owned()).await {
                Ok(Ok(p)) => Some(p),
                _ => None,
            },
        };
        let Some(tenant_permit) = tenant_permit else {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            debug!(strategy = %active.def.id, tenant = %tenant_id, "tenant slots exhausted -- skipping tick");
            return;
        };

        // Duplicate scheduling for the same strategy-and-candle is a no-op.
        let Some(lease) = self
            .leases
            .acquire(&active.def.id, &key.symbol, candle.close_time)
        else {
            debug!(strategy = %active.def.id, symbol = %key.symbol, close_time = candle.close_time, "lease held -- duplicate tick ignored");
            return;
        };

        let scheduler = self.clone();
        let key = key.clone();
        let candle = candle.clone();
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            let _permits = (global_permit, tenant_permit);
            let _lease = lease;
            scheduler.evaluate_candidate(active, &key, &candle).await;
            scheduler.in_flight.fetch_sub(1, Ordering::Relaxed);
        });
    }

    fn reserved_slot(&self, tenant_id: &str) -> Arc<Semaphore> {
        self.reserved_slots
            .lock()
            .entry(tenant_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }

    fn tenant_slot(&self, tenant_id: &str, capacity: u32) -> Arc<Semaphore> {
        let capacity = capacity.max(1);
        let mut slots = self.tenant_slots.lock();
        match slots.get(tenant_id) {
            Some((cap, sem)) if *cap == capacity => sem.clone(),
            _ => {
                let sem = Arc::new(Semaphore::new(capacity as usize));
                slots.insert(tenant_id.to_string(), (capacity, sem.clone()));
                sem
            }
        }
    }

    // -------------------------------------------------------------------------
    // Evaluation
    // -------------------------------------------------------------------------

    async fn evaluate_candidate(&self, active: ActiveStrategy, key: &SeriesKey, candle: &Candle) {
        let def = &active.def;

        let view = self.snapshot.market_view(
            &key.symbol,
            &def.timeframes,
            self.cfg.candle_lookback,
            &key.timeframe,
            candle.close_time,
        );
        // Unhealthy snapshot is a soft skip, not a strategy error.
        let Some(view) = view else {
            debug!(strategy = %def.id, symbol = %key.symbol, "snapshot incomplete -- soft skip");
            return;
        };

        let started = std::time::Instant::now();
        let result = self
            .sandbox
            .evaluate(active.compiled.clone(), view.clone(), def.deadline_ms)
            .await;

        let now = Utc::now().timestamp_millis();
        if let Err(e) = self.storage.touch_strategy_eval(&def.id, now).await {
            warn!(strategy = %def.id, error = %e, "failed to record evaluation time");
        }

        match result {
            Ok(matched) => {
                debug!(
                    strategy = %def.id,
                    symbol = %key.symbol,
                    matched,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "evaluation complete"
                );
                if def.error_count > 0 {
                    self.update_error_count(&def.id, |_| 0, None).await;
                }
                if matched && self.under_signal_cap(def, candle.close_time) {
                    if let Err(e) = self.publisher.publish_match(def, &view).await {
                        warn!(strategy = %def.id, error = %e, "signal publication failed");
                    }
                }
            }
            Err(e) if e.is_strategy_local() => {
                warn!(strategy = %def.id, symbol = %key.symbol, error = %e, "evaluation failed");
                let threshold = self.cfg.error_threshold;
                let reason = e.to_string();
                self.update_error_count(&def.id, |c| c + 1, Some((threshold, reason)))
                    .await;
            }
            Err(e) => {
                // Infrastructure fault mid-evaluation; not the strategy's
                // fault.
                error!(strategy = %def.id, error = %e, "evaluation infrastructure error");
            }
        }
    }

    /// Per-tick signal cap check and bump.
    fn under_signal_cap(&self, def: &crate::types::StrategyDef, close_time: i64) -> bool {
        let mut matches = self.tick_matches.lock();
        // Prune stale ticks so the map stays proportional to recent activity.
        if matches.len() > 16_384 {
            let horizon = close_time - 3_600_000;
            matches.retain(|(_, t), _| *t >= horizon);
        }
        let count = matches.entry((def.id.clone(), close_time)).or_insert(0);
        if *count >= def.signal_cap {
            debug!(strategy = %def.id, cap = def.signal_cap, "signal cap reached for tick");
            return false;
        }
        *count += 1;
        true
    }

    /// Read-modify-CAS the error counter; flips to errored at the threshold.
    async fn update_error_count(
        &self,
        id: &str,
        next: impl Fn(u32) -> u32,
        errored_at: Option<(u32, String)>,
    ) {
        for _ in 0..3 {
            let current = match self.storage.get_strategy(id).await {
                Ok(Some(def)) => def,
                Ok(None) => return,
                Err(e) => {
                    warn!(strategy = id, error = %e, "error-count read failed");
                    return;
                }
            };
            let new_count = next(current.error_count);
            let (state, reason) = match &errored_at {
                Some((threshold, reason)) if new_count >= *threshold => {
                    (StrategyState::Errored, Some(reason.as_str()))
                }
                _ => (current.state, current.state_reason.as_deref()),
            };

            match self
                .storage
                .cas_strategy_state(id, current.version, state, new_count, reason)
                .await
            {
                Ok(true) => {
                    if state == StrategyState::Errored {
                        warn!(
                            strategy = id,
                            errors = new_count,
                            "error threshold reached -- strategy errored"
                        );
                    }
                    if let Ok(Some(updated)) = self.storage.get_strategy(id).await {
                        self.registry.apply_update(updated);
                    }
                    return;
                }
                Ok(false) => continue, // version race; re-read
                Err(e) => {
                    warn!(strategy = id, error = %e, "error-count CAS failed");
                    return;
                }
            }
        }
        warn!(strategy = id, "error-count CAS contended; giving up this tick");
    }

    // -------------------------------------------------------------------------
    // Run loop
    // -------------------------------------------------------------------------

    pub async fn run(
        self: Arc<Self>,
        mut closes: mpsc::Receiver<CloseEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            global_slots = self.cfg.global_eval_slots,
            ceiling_ms = self.cfg.admission_ceiling_ms,
            "scheduler running"
        );
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    self.stop_intake();
                    info!("scheduler intake stopped");
                    return;
                }
                event = closes.recv() => match event {
                    Some(CloseEvent::Candle { key, candle }) => {
                        self.clone().handle_close(&key, &candle).await;
                    }
                    Some(CloseEvent::Resync { key }) => {
                        debug!(series = %key, "series resynced");
                    }
                    None => {
                        warn!("candle close stream ended");
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
