// =============================================================================
// Execution leases
// =============================================================================
//
// A lease on (strategy-id, symbol, candle-close-time) is held while an
// evaluation is in flight. Duplicate scheduling for the same
// strategy-and-candle is a no-op, which is the in-process half of the
// duplicate-candle defence (storage's unique signal constraint is the
// durable half).
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

type Key = (String, String, i64);

#[derive(Default)]
pub struct LeaseTable {
    held: Arc<Mutex<HashSet<Key>>>,
}

/// RAII guard; dropping releases the lease.
pub struct Lease {
    held: Arc<Mutex<HashSet<Key>>>,
    key: Key,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take the lease. `None` means an evaluation for this
    /// strategy-and-candle is already in flight.
    pub fn acquire(&self, strategy_id: &str, symbol: &str, close_time: i64) -> Option<Lease> {
        let key = (strategy_id.to_string(), symbol.to_string(), close_time);
        let mut held = self.held.lock();
        if held.insert(key.clone()) {
            Some(Lease {
                held: self.held.clone(),
                key,
            })
        } else {
            None
        }
    }

    /// Leases currently in flight.
    pub fn in_flight(&self) -> usize {
        self.held.lock().len()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.held.lock().remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_acquire_is_refused() {
        let table = LeaseTable::new();
        let lease = table.acquire("s1", "BTCUSDT", 1_000);
        assert!(lease.is_some());
        assert!(table.acquire("s1", "BTCUSDT", 1_000).is_none());
        // Different symbol or close time is a different lease.
        assert!(table.acquire("s1", "ETHUSDT", 1_000).is_some());
        assert!(table.acquire("s1", "BTCUSDT", 2_000).is_some());
    }

    #[test]
    fn drop_releases() {
        let table = LeaseTable::new();
        {
            let _lease = table.acquire("s1", "BTCUSDT", 1_000).unwrap();
            assert_eq!(table.in_flight(), 1);
        }
        assert_eq!(table.in_flight(), 0);
        assert!(table.acquire("s1", "BTCUSDT", 1_000).is_some());
    }
}
