// =============================================================================
// Signal Publisher -- at-most-once persistence, at-least-once emission
// =============================================================================
//
// The storage unique constraint on (strategy, symbol, close-time) is the
// dedup authority; a conflict counts as success, so retries and scheduler
// restarts can never create a second signal for the same candle. The bus
// emission happens after the insert and never rolls it back.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::bus::EventBus;
use crate::errors::Result;
use crate::storage::{SignalInsert, Storage};
use crate::types::{MarketView, Signal, SourceLabel, StrategyDef};

/// Outcome of publishing one match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    Duplicate,
}

pub struct SignalPublisher {
    storage: Arc<dyn Storage>,
    bus: Arc<EventBus>,
    source: SourceLabel,
}

impl SignalPublisher {
    pub fn new(storage: Arc<dyn Storage>, bus: Arc<EventBus>, source: SourceLabel) -> Self {
        Self {
            storage,
            bus,
            source,
        }
    }

    /// Persist a strategy match and emit its event.
    pub async fn publish_match(
        &self,
        strategy: &StrategyDef,
        view: &MarketView,
    ) -> Result<PublishOutcome> {
        let signal = Signal {
            id: Uuid::new_v4().to_string(),
            strategy_id: strategy.id.clone(),
            tenant_id: strategy.tenant_id.clone(),
            symbol: view.symbol.clone(),
            close_time: view.close_time,
            price: view
                .series(&view.timeframe)
                .last()
                .map(|c| c.close)
                .unwrap_or(view.ticker.last_price),
            quote_volume: view.ticker.quote_volume_24h,
            source: self.source,
            metadata: Default::default(),
            created_at: Utc::now().timestamp_millis(),
        };

        match self.storage.insert_signal(&signal).await? {
            SignalInsert::Created => {
                info!(
                    strategy = %signal.strategy_id,
                    symbol = %signal.symbol,
                    close_time = signal.close_time,
                    price = signal.price,
                    "signal published"
                );
                self.bus.publish_signal(signal);
                Ok(PublishOutcome::Published)
            }
            SignalInsert::AlreadyExists => {
                debug!(
                    strategy = %signal.strategy_id,
                    symbol = %signal.symbol,
                    close_time = signal.close_time,
                    "signal already persisted -- re-emitting event only"
                );
                // At-least-once emission: a crash between insert and emit is
                // healed by the retry path landing here.
                self.bus.publish_signal(signal);
                Ok(PublishOutcome::Duplicate)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::types::{Candle, StrategyState, Ticker};
    use std::collections::HashMap;

    fn view(close_time: i64, close: f64) -> MarketView {
        let candle = Candle {
            open_time: close_time - 59_999,
            close_time,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            quote_volume: 10.0,
            is_closed: true,
        };
        let mut candles = HashMap::new();
        candles.insert("1m".to_string(), vec![candle]);
        MarketView {
            symbol: "SOLUSDT".into(),
            ticker: Ticker {
                symbol: "SOLUSDT".into(),
                last_price: close,
                change_pct_24h: 0.0,
                quote_volume_24h: 123.0,
                updated_at: close_time,
            },
            candles,
            close_time,
            timeframe: "1m".into(),
        }
    }

    fn strategy() -> StrategyDef {
        StrategyDef {
            id: "s1".into(),
            tenant_id: "t1".into(),
            name: "always".into(),
            source: "return true".into(),
            symbols: vec!["SOLUSDT".into()],
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
        }
    }

    #[tokio::test]
    async fn publish_persists_and_emits() {
        let storage = Arc::new(MemoryStorage::new());
        let bus = Arc::new(EventBus::new(16));
        let mut rx = bus.subscribe_signals();
        let publisher =
            SignalPublisher::new(storage.clone(), bus.clone(), SourceLabel::Local);

        let outcome = publisher
            .publish_match(&strategy(), &view(59_999, 150.0))
            .await
            .unwrap();
        assert_eq!(outcome, PublishOutcome::Published);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.signal.symbol, "SOLUSDT");
        assert_eq!(event.signal.price, 150.0);
        assert_eq!(storage.list_signals("s1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_match_is_absorbed_but_reemitted() {
        let storage = Arc::new(MemoryStorage::new());
        let bus = Arc::new(EventBus::new(16));
        let mut rx = bus.subscribe_signals();
        let publisher =
            SignalPublisher::new(storage.clone(), bus.clone(), SourceLabel::Local);

        let v = view(59_999, 150.0);
        assert_eq!(
            publisher.publish_match(&strategy(), &v).await.unwrap(),
            PublishOutcome::Published
        );
        assert_eq!(
            publisher.publish_match(&strategy(), &v).await.unwrap(),
            PublishOutcome::Duplicate
        );

        // One persisted row, two emitted events (consumers dedupe by key).
        assert_eq!(storage.list_signals("s1").await.unwrap().len(), 1);
        assert!(rx.recv().await.is_ok());
        assert!(rx.recv().await.is_ok());
    }

    #[tokio::test]
    async fn distinct_closes_create_distinct_signals() {
        let storage = Arc::new(MemoryStorage::new());
        let bus = Arc::new(EventBus::new(16));
        let publisher =
            SignalPublisher::new(storage.clone(), bus.clone(), SourceLabel::Local);

        for t in [59_999i64, 119_999, 179_999] {
            let outcome = publisher
                .publish_match(&strategy(), &view(t, 150.0))
                .await
                .unwrap();
            assert_eq!(outcome, PublishOutcome::Published);
        }
        assert_eq!(storage.list_signals("s1").await.unwrap().len(), 3);
    }
}
