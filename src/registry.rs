// =============================================================================
// Strategy Registry -- canonical in-memory view of active strategies
// =============================================================================
//
// Single-writer reconcile task polls storage on an interval and diffs
// create/update/disable against the in-memory map. Source changes recompile;
// a compile failure CAS-es the strategy to errored with the structured error
// text persisted as the state reason, and the strategy is never scheduled.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::errors::Result;
use crate::sandbox::CompiledStrategy;
use crate::storage::Storage;
use crate::types::{StrategyDef, StrategyState};

/// One live strategy: definition plus its compiled program.
#[derive(Clone)]
pub struct ActiveStrategy {
    pub def: StrategyDef,
    pub compiled: Arc<CompiledStrategy>,
}

pub struct StrategyRegistry {
    storage: Arc<dyn Storage>,
    /// Tenant selector: `Some` narrows to one tenant (local mode).
    tenant: Option<String>,
    active: RwLock<HashMap<String, ActiveStrategy>>,
}

impl StrategyRegistry {
    pub fn new(storage: Arc<dyn Storage>, tenant: Option<String>) -> Self {
        Self {
            storage,
            tenant,
            active: RwLock::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Reads (scheduler path)
    // -------------------------------------------------------------------------

    /// Strategies currently in the running state.
    pub fn running(&self) -> Vec<ActiveStrategy> {
        self.active
            .read()
            .values()
            .filter(|s| s.def.state == StrategyState::Running)
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<ActiveStrategy> {
        self.active.read().get(id).cloned()
    }

    /// All known strategies (admin listing).
    pub fn all(&self) -> Vec<StrategyDef> {
        let mut out: Vec<StrategyDef> =
            self.active.read().values().map(|s| s.def.clone()).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Union of (symbols, timeframes) the running strategies need from the
    /// hub. Strategies following the top-volume set contribute no pinned
    /// symbols here; the caller merges the tracker's current set.
    pub fn subscription_needs(&self) -> (Vec<String>, Vec<String>) {
        let active = self.active.read();
        let mut symbols = std::collections::BTreeSet::new();
        let mut timeframes = std::collections::BTreeSet::new();
        for s in active.values() {
            if s.def.state != StrategyState::Running {
                continue;
            }
            for sym in &s.def.symbols {
                symbols.insert(sym.clone());
            }
            for tf in &s.def.timeframes {
                timeframes.insert(tf.clone());
            }
        }
        (
            symbols.into_iter().collect(),
            timeframes.into_iter().collect(),
        )
    }

    /// Apply an updated definition coming from the scheduler's own CAS
    /// writes (error counts, state flips) without waiting for the next poll.
    pub fn apply_update(&self, def: StrategyDef) {
        let mut active = self.active.write();
        match active.get_mut(&def.id) {
            Some(entry) => entry.def = def,
            None => debug!(id = %def.id, "update for unknown strategy ignored"),
        }
    }

    // -------------------------------------------------------------------------
    // Reconciliation (single writer)
    // -------------------------------------------------------------------------

    /// One reconcile pass: load from storage, diff, compile what changed.
    pub async fn reconcile(&self) -> Result<()> {
        let defs = self.storage.list_strategies(self.tenant.as_deref()).await?;
        let mut seen: Vec<String> = Vec::with_capacity(defs.len());

        for def in defs {
            seen.push(def.id.clone());
            let needs_compile = {
                let active = self.active.read();
                match active.get(&def.id) {
                    Some(existing) => existing.def.source != def.source,
                    None => true,
                }
            };

            if !needs_compile {
                // Definition metadata may still have moved (state, quota
                // edits); keep the newest.
                let mut active = self.active.write();
                if let Some(entry) = active.get_mut(&def.id) {
                    if entry.def.version < def.version || entry.def.updated_at < def.updated_at {
                        entry.def = def;
                    }
                }
                continue;
            }

            match CompiledStrategy::compile(&def.source) {
                Ok(compiled) => {
                    info!(id = %def.id, name = %def.name, "strategy compiled");
                    let mut def = def;
                    // starting -> running happens once the compile succeeds
                    // and the hub carries the subscription.
                    if def.state == StrategyState::Starting {
                        if self
                            .storage
                            .cas_strategy_state(
                                &def.id,
                                def.version,
                                StrategyState::Running,
                                0,
                                None,
                            )
                            .await?
                        {
                            def.state = StrategyState::Running;
                            def.error_count = 0;
                            def.version += 1;
                        }
                    }
                    self.active.write().insert(
                        def.id.clone(),
                        ActiveStrategy {
                            def,
                            compiled: Arc::new(compiled),
                        },
                    );
                }
                Err(compile_err) => {
                    warn!(id = %def.id, error = %compile_err, "strategy failed to compile");
                    let reason = compile_err.to_string();
                    if !self
                        .storage
                        .cas_strategy_state(
                            &def.id,
                            def.version,
                            StrategyState::Errored,
                            def.error_count,
                            Some(&reason),
                        )
                        .await?
                    {
                        debug!(id = %def.id, "errored CAS lost -- next poll retries");
                    }
                    self.active.write().remove(&def.id);
                }
            }
        }

        // Strategies removed or disabled in storage drop out of memory.
        let mut active = self.active.write();
        active.retain(|id, _| seen.contains(id));
        Ok(())
    }

    /// Reconcile loop; the change-notification mechanism over the storage
    /// contract.
    pub async fn run(
        self: Arc<Self>,
        poll_interval: std::time::Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(interval_secs = poll_interval.as_secs(), "registry reconcile loop started");
        let mut ticker = tokio::time::interval(poll_interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("registry stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile().await {
                        warn!(error = %e, "registry reconcile failed");
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
