// =============================================================================
// Internal event bus
// =============================================================================
//
// Bounded broadcast channels for downstream consumers (notification workers,
// analytics). Signal events are at-least-once: consumers dedupe on the
// persisted signal id. Position events are last-wins: each carries a
// per-position monotonic revision.
// =============================================================================

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use crate::types::{Position, Signal};

#[derive(Debug, Clone)]
pub struct SignalEvent {
    pub signal: Signal,
}

#[derive(Debug, Clone)]
pub struct PositionEvent {
    pub position: Position,
    /// Monotonic per-position revision; consumers keep the highest seen.
    pub revision: u64,
}

pub struct EventBus {
    signal_tx: broadcast::Sender<SignalEvent>,
    position_tx: broadcast::Sender<PositionEvent>,
    revisions: Mutex<HashMap<String, u64>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (signal_tx, _) = broadcast::channel(capacity);
        let (position_tx, _) = broadcast::channel(capacity);
        Self {
            signal_tx,
            position_tx,
            revisions: Mutex::new(HashMap::new()),
        }
    }

    /// Emit a signal event. Lagging or absent receivers never fail the
    /// publisher; the persisted row is authoritative.
    pub fn publish_signal(&self, signal: Signal) {
        let receivers = self.signal_tx.receiver_count();
        if self.signal_tx.send(SignalEvent { signal }).is_err() {
            debug!(receivers, "signal event dropped -- no subscribers");
        }
    }

    /// Emit a position-changed event with the next revision for that
    /// position.
    pub fn publish_position(&self, position: Position) {
        let revision = {
            let mut revisions = self.revisions.lock();
            let entry = revisions.entry(position.id.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        if self
            .position_tx
            .send(PositionEvent { position, revision })
            .is_err()
        {
            debug!("position event dropped -- no subscribers");
        }
    }

    pub fn subscribe_signals(&self) -> broadcast::Receiver<SignalEvent> {
        self.signal_tx.subscribe()
    }

    pub fn subscribe_positions(&self) -> broadcast::Receiver<PositionEvent> {
        self.position_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PositionStatus, Side, SourceLabel};

    fn position(id: &str) -> Position {
        Position {
            id: id.into(),
            tenant_id: "t1".into(),
            strategy_id: "s1".into(),
            signal_id: None,
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            entry_price: 100.0,
            quantity: 1.0,
            stop_loss: None,
            take_profit: None,
            status: PositionStatus::Open,
            exit_price: None,
            exit_reason: None,
            realized_pnl: None,
            opened_at: 0,
            closed_at: None,
        }
    }

    #[tokio::test]
    async fn position_revisions_are_monotonic() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe_positions();

        bus.publish_position(position("p1"));
        bus.publish_position(position("p1"));
        bus.publish_position(position("p2"));

        assert_eq!(rx.recv().await.unwrap().revision, 1);
        assert_eq!(rx.recv().await.unwrap().revision, 2);
        // Independent counter per position.
        assert_eq!(rx.recv().await.unwrap().revision, 1);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new(16);
        let signal = Signal {
            id: "sig".into(),
            strategy_id: "s1".into(),
            tenant_id: "t1".into(),
            symbol: "BTCUSDT".into(),
            close_time: 0,
            price: 1.0,
            quote_volume: 1.0,
            source: SourceLabel::Local,
            metadata: Default::default(),
            created_at: 0,
        };
        bus.publish_signal(signal);
        bus.publish_position(position("p1"));
    }
}
