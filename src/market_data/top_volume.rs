// =============================================================================
// Top-volume tracker
// =============================================================================
//
// Strategies with no pinned symbols follow "the top N symbols by 24h quote
// volume". This tracker polls the 24hr ticker endpoint (never faster than
// 1 Hz) and keeps the full descending-volume ranking; callers slice it at
// their tenant-configured N.
// =============================================================================

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::exchange::ExchangeClient;

/// Only quote-asset pairs the screener trades are ranked.
const QUOTE_SUFFIX: &str = "USDT";

pub struct TopVolumeTracker {
    /// Symbols in descending 24h quote volume order.
    ranking: RwLock<Vec<String>>,
}

impl TopVolumeTracker {
    pub fn new() -> Self {
        Self {
            ranking: RwLock::new(Vec::new()),
        }
    }

    /// Whether `symbol` is currently inside the top `n`.
    pub fn contains(&self, symbol: &str, n: usize) -> bool {
        let ranking = self.ranking.read();
        ranking.iter().take(n).any(|s| s == symbol)
    }

    /// The current top `n` symbols, best first.
    pub fn top(&self, n: usize) -> Vec<String> {
        self.ranking.read().iter().take(n).cloned().collect()
    }

    /// True once at least one poll has succeeded.
    pub fn ready(&self) -> bool {
        !self.ranking.read().is_empty()
    }

    /// Replace the ranking from a fresh ticker listing.
    pub fn update(&self, mut tickers: Vec<crate::types::Ticker>) {
        tickers.retain(|t| t.symbol.ends_with(QUOTE_SUFFIX));
        tickers.sort_by(|a, b| {
            b.quote_volume_24h
                .partial_cmp(&a.quote_volume_24h)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let ranking: Vec<String> = tickers.into_iter().map(|t| t.symbol).collect();
        debug!(symbols = ranking.len(), "top-volume ranking refreshed");
        *self.ranking.write() = ranking;
    }

    /// Poll loop. `interval` is clamped to the 1 Hz ceiling by the caller.
    pub async fn run(
        self: Arc<Self>,
        client: Arc<ExchangeClient>,
        interval: std::time::Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(interval_secs = interval.as_secs(), "top-volume tracker started");
        // First poll after one full interval; startup never blocks on it.
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("top-volume tracker stopped");
                    return;
                }
                _ = ticker.tick() => {
                    match client.get_ticker_24hr().await {
                        Ok(tickers) => self.update(tickers),
                        Err(e) => warn!(error = %e, "top-volume poll failed"),
                    }
                }
            }
        }
    }
}

impl Default for TopVolumeTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Ticker;

    fn ticker(symbol: &str, quote_volume: f64) -> Ticker {
        Ticker {
            symbol: symbol.into(),
            last_price: 1.0,
            change_pct_24h: 0.0,
            quote_volume_24h: quote_volume,
            updated_at: 0,
        }
    }

    #[test]
    fn ranks_by_quote_volume() {
        let tracker = TopVolumeTracker::new();
        tracker.update(vec![
            ticker("XRPUSDT", 10.0),
            ticker("BTCUSDT", 1_000.0),
            ticker("ETHUSDT", 500.0),
        ]);
        assert_eq!(tracker.top(2), vec!["BTCUSDT", "ETHUSDT"]);
        assert!(tracker.contains("XRPUSDT", 3));
        assert!(!tracker.contains("XRPUSDT", 2));
    }

    #[test]
    fn non_quote_pairs_filtered() {
        let tracker = TopVolumeTracker::new();
        tracker.update(vec![ticker("BTCEUR", 9_999.0), ticker("BTCUSDT", 1.0)]);
        assert_eq!(tracker.top(10), vec!["BTCUSDT"]);
    }

    #[test]
    fn rotation_updates_membership() {
        let tracker = TopVolumeTracker::new();
        tracker.update(vec![ticker("XRPUSDT", 100.0), ticker("BTCUSDT", 50.0)]);
        assert!(tracker.contains("XRPUSDT", 1));

        tracker.update(vec![ticker("XRPUSDT", 10.0), ticker("BTCUSDT", 50.0)]);
        assert!(!tracker.contains("XRPUSDT", 1));
        assert!(tracker.contains("XRPUSDT", 2));
    }
}
