// =============================================================================
// Strategy Sandbox -- compile user source, run it bounded
// =============================================================================
//
// Compilation wraps the user's Go-flavoured function body, resolves every
// identifier against the host whitelist, and rejects anything else with a
// structured (line, col, message) error.
//
// Each run is bounded three ways: a wall-clock deadline enforced by a
// watchdog timeout, a cancel flag the evaluator observes within the grace
// window, and a fuel budget that caps CPU even if both are defeated. Panics
// inside the evaluator are caught and surfaced as strategy-local errors.
// =============================================================================

pub mod eval;
pub mod lexer;
pub mod parser;

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::errors::{CompileError, EngineError};
use crate::types::MarketView;

use eval::{EvalError, DEFAULT_FUEL};
use parser::Program;

/// A compiled, immutable strategy program. Cheap to share; one compiled
/// strategy may be evaluated concurrently against many symbols.
#[derive(Debug, Clone)]
pub struct CompiledStrategy {
    program: Program,
}

impl CompiledStrategy {
    /// Compile strategy source. All whitelist violations surface here, never
    /// at run time.
    pub fn compile(source: &str) -> Result<Self, CompileError> {
        let program = parser::compile(source)?;
        Ok(Self { program })
    }

    /// Synchronous, fuel-bounded evaluation. Callers wanting a wall-clock
    /// deadline go through [`Sandbox::evaluate`].
    pub fn evaluate_blocking(
        &self,
        view: &MarketView,
        cancel: &AtomicBool,
    ) -> Result<bool, EvalError> {
        eval::run(&self.program, view, cancel, DEFAULT_FUEL)
    }
}

/// Deadline-enforcing evaluation host.
#[derive(Debug, Clone)]
pub struct Sandbox {
    /// Ceiling on strategy-overridable deadlines, milliseconds.
    pub deadline_ceiling_ms: u64,
    /// Grace window after the deadline before the run is abandoned.
    pub cancel_grace_ms: u64,
}

impl Default for Sandbox {
    fn default() -> Self {
        Self {
            deadline_ceiling_ms: 30_000,
            cancel_grace_ms: 100,
        }
    }
}

impl Sandbox {
    /// Run one evaluation with a wall-clock deadline.
    ///
    /// The view is moved into the evaluation; it is a point-in-time snapshot
    /// and observes no further updates. On deadline expiry the cancel flag is
    /// raised and the evaluator is given the grace window to return; either
    /// way the caller gets `StrategyDeadline` and no signal is published for
    /// the tick.
    pub async fn evaluate(
        &self,
        compiled: Arc<CompiledStrategy>,
        view: MarketView,
        deadline_ms: u64,
    ) -> Result<bool, EngineError> {
        let deadline_ms = deadline_ms.clamp(1, self.deadline_ceiling_ms);
        let cancel = Arc::new(AtomicBool::new(false));
        let eval_cancel = cancel.clone();

        let mut handle = tokio::task::spawn_blocking(move || {
            std::panic::catch_unwind(AssertUnwindSafe(|| {
                compiled.evaluate_blocking(&view, &eval_cancel)
            }))
        });

        let deadline = std::time::Duration::from_millis(deadline_ms);
        match tokio::time::timeout(deadline, &mut handle).await {
            Ok(joined) => flatten_result(joined),
            Err(_elapsed) => {
                cancel.store(true, Ordering::Relaxed);
                debug!(deadline_ms, "evaluation deadline fired -- cancelling");

                // Give the evaluator the grace window to observe the flag.
                let grace = std::time::Duration::from_millis(self.cancel_grace_ms);
                match tokio::time::timeout(grace, &mut handle).await {
                    Ok(_) => {}
                    Err(_) => {
                        // The blocking task will still die on fuel; the worker
                        // thread is reclaimed then.
                        warn!(
                            deadline_ms,
                            grace_ms = self.cancel_grace_ms,
                            "evaluation did not return within the grace window"
                        );
                    }
                }
                Err(EngineError::StrategyDeadline(deadline_ms))
            }
        }
    }
}

fn flatten_result(
    joined: Result<std::thread::Result<Result<bool, EvalError>>, tokio::task::JoinError>,
) -> Result<bool, EngineError> {
    match joined {
        Ok(Ok(Ok(matched))) => Ok(matched),
        Ok(Ok(Err(EvalError::Cancelled))) => {
            // The watchdog raced the evaluator's own flag check; classify as
            // a deadline either way.
            Err(EngineError::StrategyDeadline(0))
        }
        Ok(Ok(Err(EvalError::OutOfFuel))) => Err(EngineError::StrategyRuntime(
            "evaluation exceeded its step budget".into(),
        )),
        Ok(Ok(Err(EvalError::Runtime(msg)))) => Err(EngineError::StrategyRuntime(msg)),
        Ok(Err(panic)) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "panic".to_string());
            Err(EngineError::StrategyRuntime(format!(
                "evaluation panicked: {msg}"
            )))
        }
        Err(join_err) => Err(EngineError::StrategyRuntime(format!(
            "evaluation task failed: {join_err}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Candle, Ticker};
    use std::collections::HashMap;

    fn simple_view() -> MarketView {
        let candles: Vec<Candle> = (0..30)
            .map(|i| Candle {
                open_time: i * 60_000,
                close_time: i * 60_000 + 59_999,
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.0 + (i % 3) as f64,
                volume: 5.0,
                quote_volume: 500.0,
                is_closed: true,
            })
            .collect();
        let mut map = HashMap::new();
        map.insert("1m".to_string(), candles);
        MarketView {
            symbol: "BTCUSDT".into(),
            ticker: Ticker {
                symbol: "BTCUSDT".into(),
                last_price: 102.0,
                change_pct_24h: 0.0,
                quote_volume_24h: 0.0,
                updated_at: 0,
            },
            candles: map,
            close_time: 29 * 60_000 + 59_999,
            timeframe: "1m".into(),
        }
    }

    #[tokio::test]
    async fn always_match_strategy() {
        let compiled = Arc::new(CompiledStrategy::compile("return true").unwrap());
        let sandbox = Sandbox::default();
        let result = sandbox.evaluate(compiled, simple_view(), 5_000).await;
        assert_eq!(result.unwrap(), true);
    }

    #[tokio::test]
    async fn infinite_loop_hits_deadline() {
        let compiled = Arc::new(CompiledStrategy::compile("for { }").unwrap());
        let sandbox = Sandbox::default();
        let start = std::time::Instant::now();
        let result = sandbox.evaluate(compiled, simple_view(), 50).await;
        assert!(matches!(result, Err(EngineError::StrategyDeadline(_))));
        // Deadline plus grace, with scheduling slack.
        assert!(start.elapsed() < std::time::Duration::from_secs(2));
    }

    #[tokio::test]
    async fn deadline_clamped_to_ceiling() {
        let sandbox = Sandbox {
            deadline_ceiling_ms: 40,
            cancel_grace_ms: 100,
        };
        let compiled = Arc::new(CompiledStrategy::compile("for { }").unwrap());
        let result = sandbox.evaluate(compiled, simple_view(), 600_000).await;
        assert!(matches!(result, Err(EngineError::StrategyDeadline(_))));
    }

    #[tokio::test]
    async fn compile_error_is_structured() {
        let err = CompiledStrategy::compile("return read_file(\"/etc/passwd\")").unwrap_err();
        assert!(err.message.contains("unknown function 'read_file'"));
        assert_eq!(err.line, 1);
    }

    #[tokio::test]
    async fn concurrent_evaluations_share_one_program() {
        let compiled =
            Arc::new(CompiledStrategy::compile("return rsi(\"1m\", 14) >= 0").unwrap());
        let sandbox = Sandbox::default();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let c = compiled.clone();
            let s = sandbox.clone();
            handles.push(tokio::spawn(async move {
                s.evaluate(c, simple_view(), 5_000).await
            }));
        }
        for h in handles {
            assert!(h.await.unwrap().unwrap());
        }
    }
}
