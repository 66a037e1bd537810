// =============================================================================
// Market store -- candle ring buffers and last-ticker table
// =============================================================================
//
// Single writer (the hub), many readers. Readers copy what they need under a
// short read lock; each returned ticker or candle slice is internally
// consistent. Cross-symbol consistency is not promised and not needed.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;

use crate::types::{Candle, MarketView, SeriesKey, Ticker};

/// Partial ticker fields as they arrive on the wire. Missing fields keep the
/// previous record's values so published tickers are always complete.
#[derive(Debug, Clone, Default)]
pub struct TickerUpdate {
    pub symbol: String,
    pub last_price: Option<f64>,
    pub change_pct_24h: Option<f64>,
    pub quote_volume_24h: Option<f64>,
    pub event_time: i64,
}

/// Outcome of applying one candle update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandleApply {
    /// The in-progress candle was created or updated in place.
    Progress,
    /// The candle transitioned to closed (or arrived already closed).
    Closed,
    /// The update was older than what the series already holds and was
    /// discarded.
    Stale,
}

/// Thread-safe store holding the most recent candles per (symbol, timeframe)
/// plus one in-progress candle, and the last complete ticker per symbol.
pub struct MarketStore {
    candles: RwLock<HashMap<SeriesKey, VecDeque<Candle>>>,
    tickers: RwLock<HashMap<String, Ticker>>,
    max_candles: usize,
}

impl MarketStore {
    /// `max_candles` closed candles are retained per series, sized for the
    /// largest indicator lookback plus slack.
    pub fn new(max_candles: usize) -> Self {
        Self {
            candles: RwLock::new(HashMap::new()),
            tickers: RwLock::new(HashMap::new()),
            max_candles,
        }
    }

    // -------------------------------------------------------------------------
    // Writes (hub only)
    // -------------------------------------------------------------------------

    /// Insert or replace the latest candle for `key`.
    ///
    /// An open candle replaces the in-progress candle with the same
    /// `open_time`; a closed candle finalises it and trims the ring. Updates
    /// older than the newest closed candle are discarded as stale.
    pub fn apply_candle(&self, key: SeriesKey, candle: Candle) -> CandleApply {
        let mut map = self.candles.write();
        let ring = map
            .entry(key)
            .or_insert_with(|| VecDeque::with_capacity(self.max_candles + 1));

        if let Some(newest_closed) = ring.iter().rev().find(|c| c.is_closed) {
            if candle.open_time < newest_closed.open_time
                || (candle.open_time == newest_closed.open_time && !candle.is_closed)
            {
                return CandleApply::Stale;
            }
            if candle.open_time == newest_closed.open_time {
                // Same closed candle re-delivered (REST/ws overlap).
                return CandleApply::Stale;
            }
        }

        // Replace the in-progress version of this same candle, if present.
        if let Some(last) = ring.back() {
            if !last.is_closed && last.open_time == candle.open_time {
                ring.pop_back();
            }
        }

        let closed = candle.is_closed;
        ring.push_back(candle);

        if closed {
            while ring.iter().filter(|c| c.is_closed).count() > self.max_candles {
                ring.pop_front();
            }
            CandleApply::Closed
        } else {
            CandleApply::Progress
        }
    }

    /// Merge a partial ticker update into the previous record and return the
    /// complete merged ticker.
    pub fn merge_ticker(&self, update: TickerUpdate) -> Ticker {
        let mut map = self.tickers.write();
        let entry = map.entry(update.symbol.clone()).or_insert_with(|| Ticker {
            symbol: update.symbol.clone(),
            last_price: 0.0,
            change_pct_24h: 0.0,
            quote_volume_24h: 0.0,
            updated_at: 0,
        });

        if let Some(p) = update.last_price {
            entry.last_price = p;
        }
        if let Some(c) = update.change_pct_24h {
            entry.change_pct_24h = c;
        }
        if let Some(q) = update.quote_volume_24h {
            entry.quote_volume_24h = q;
        }
        entry.updated_at = update.event_time;

        entry.clone()
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// The most recent `count` closed candles for `key`, oldest-first.
    pub fn closed_candles(&self, key: &SeriesKey, count: usize) -> Vec<Candle> {
        let map = self.candles.read();
        match map.get(key) {
            Some(ring) => {
                let closed: Vec<&Candle> = ring.iter().filter(|c| c.is_closed).collect();
                let start = closed.len().saturating_sub(count);
                closed[start..].iter().map(|c| (*c).clone()).collect()
            }
            None => Vec::new(),
        }
    }

    /// Close time of the newest closed candle in the series, if any.
    pub fn last_close_time(&self, key: &SeriesKey) -> Option<i64> {
        let map = self.candles.read();
        map.get(key)
            .and_then(|ring| ring.iter().rev().find(|c| c.is_closed).map(|c| c.close_time))
    }

    /// Last complete ticker for `symbol`.
    pub fn ticker(&self, symbol: &str) -> Option<Ticker> {
        self.tickers.read().get(symbol).cloned()
    }

    /// All known tickers (used by the admin surface and top-volume fallback).
    pub fn tickers(&self) -> Vec<Ticker> {
        self.tickers.read().values().cloned().collect()
    }

    /// Number of closed candles currently held for `key`.
    pub fn closed_count(&self, key: &SeriesKey) -> usize {
        let map = self.candles.read();
        map.get(key)
            .map_or(0, |ring| ring.iter().filter(|c| c.is_closed).count())
    }

    /// Assemble the read-only bundle for one evaluation: the symbol's ticker
    /// plus up to `lookback` closed candles per requested timeframe.
    ///
    /// Returns `None` when the ticker or the triggering timeframe's candles
    /// are missing; the scheduler treats that as a soft skip.
    pub fn market_view(
        &self,
        symbol: &str,
        timeframes: &[String],
        lookback: usize,
        trigger_tf: &str,
        close_time: i64,
    ) -> Option<MarketView> {
        let ticker = self.ticker(symbol)?;

        let mut candles = HashMap::new();
        for tf in timeframes {
            let key = SeriesKey::new(symbol, tf.clone());
            let slice = self.closed_candles(&key, lookback);
            if tf == trigger_tf && slice.is_empty() {
                return None;
            }
            candles.insert(tf.clone(), slice);
        }

        Some(MarketView {
            symbol: symbol.to_string(),
            ticker,
            candles,
            close_time,
            timeframe: trigger_tf.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_candle(open_time: i64, close: f64, is_closed: bool) -> Candle {
        Candle {
            open_time,
            close_time: open_time + 59_999,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 100.0,
            quote_volume: 200.0,
            is_closed,
        }
    }

    fn key(sym: &str) -> SeriesKey {
        SeriesKey::new(sym, "1m")
    }

    #[test]
    fn ring_trimming() {
        let store = MarketStore::new(3);
        for i in 0..5 {
            store.apply_candle(key("BTCUSDT"), sample_candle(i * 60_000, 100.0 + i as f64, true));
        }
        let closed = store.closed_candles(&key("BTCUSDT"), 10);
        assert_eq!(closed.len(), 3);
        assert_eq!(closed.last().unwrap().close, 104.0);
    }

    #[test]
    fn in_progress_replacement_then_close() {
        let store = MarketStore::new(10);
        assert_eq!(
            store.apply_candle(key("ETHUSDT"), sample_candle(0, 50.0, false)),
            CandleApply::Progress
        );
        assert_eq!(
            store.apply_candle(key("ETHUSDT"), sample_candle(0, 51.0, false)),
            CandleApply::Progress
        );
        assert_eq!(
            store.apply_candle(key("ETHUSDT"), sample_candle(0, 52.0, true)),
            CandleApply::Closed
        );
        let closed = store.closed_candles(&key("ETHUSDT"), 10);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].close, 52.0);
    }

    #[test]
    fn duplicate_close_is_stale() {
        let store = MarketStore::new(10);
        store.apply_candle(key("BTCUSDT"), sample_candle(0, 50.0, true));
        assert_eq!(
            store.apply_candle(key("BTCUSDT"), sample_candle(0, 50.0, true)),
            CandleApply::Stale
        );
        assert_eq!(store.closed_count(&key("BTCUSDT")), 1);
    }

    #[test]
    fn older_candle_is_stale() {
        let store = MarketStore::new(10);
        store.apply_candle(key("BTCUSDT"), sample_candle(120_000, 50.0, true));
        assert_eq!(
            store.apply_candle(key("BTCUSDT"), sample_candle(60_000, 49.0, true)),
            CandleApply::Stale
        );
    }

    #[test]
    fn ticker_merge_keeps_previous_fields() {
        let store = MarketStore::new(10);
        store.merge_ticker(TickerUpdate {
            symbol: "BTCUSDT".into(),
            last_price: Some(37_000.0),
            change_pct_24h: Some(1.5),
            quote_volume_24h: Some(1e9),
            event_time: 1,
        });
        let merged = store.merge_ticker(TickerUpdate {
            symbol: "BTCUSDT".into(),
            last_price: Some(37_100.0),
            change_pct_24h: None,
            quote_volume_24h: None,
            event_time: 2,
        });
        assert_eq!(merged.last_price, 37_100.0);
        assert_eq!(merged.change_pct_24h, 1.5);
        assert_eq!(merged.quote_volume_24h, 1e9);
        assert_eq!(merged.updated_at, 2);
    }

    #[test]
    fn market_view_requires_trigger_series() {
        let store = MarketStore::new(10);
        store.merge_ticker(TickerUpdate {
            symbol: "BTCUSDT".into(),
            last_price: Some(37_000.0),
            change_pct_24h: Some(0.0),
            quote_volume_24h: Some(0.0),
            event_time: 1,
        });
        let tfs = vec!["1m".to_string()];
        assert!(store.market_view("BTCUSDT", &tfs, 50, "1m", 0).is_none());

        store.apply_candle(key("BTCUSDT"), sample_candle(0, 37_000.0, true));
        let view = store.market_view("BTCUSDT", &tfs, 50, "1m", 59_999).unwrap();
        assert_eq!(view.series("1m").len(), 1);
        assert_eq!(view.ticker.last_price, 37_000.0);
    }

    #[test]
    fn market_view_missing_ticker() {
        let store = MarketStore::new(10);
        store.apply_candle(key("BTCUSDT"), sample_candle(0, 37_000.0, true));
        let tfs = vec!["1m".to_string()];
        assert!(store.market_view("BTCUSDT", &tfs, 50, "1m", 0).is_none());
    }
}
