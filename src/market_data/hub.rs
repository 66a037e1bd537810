// =============================================================================
// Market-Data Hub -- sole owner of the exchange streaming relationship
// =============================================================================
//
// One combined-stream connection per shard of the subscription set. The hub
// writes every frame into the MarketStore and fans events out to subscribers:
//
//   * Ticks: best-effort. A full subscriber channel drops the event for that
//     subscriber only and bumps its drop counter. The hub never blocks.
//   * Candle closes: guaranteed per series, in non-decreasing close-time
//     order. A full channel spills into a per-subscriber retry buffer; a full
//     retry buffer marks the subscriber unhealthy.
//
// Close events are deduplicated at the source against the last emitted
// close-time per series, so duplicate is-final frames and REST/ws overlap
// after a resync never replay.
// =============================================================================

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch, Notify};
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

use crate::exchange::ExchangeClient;
use crate::types::{Candle, SeriesKey, Ticker};

use super::store::{CandleApply, MarketStore};
use super::stream::{build_stream_url, parse_frame, WireEvent, MAX_STREAMS_PER_CONN};

/// Warn when exchange event timestamps drift further than this from local
/// time.
const CLOCK_SKEW_WARN_MS: i64 = 5_000;

/// Candle-close fan-out event.
#[derive(Debug, Clone)]
pub enum CloseEvent {
    /// A candle transitioned from open to closed.
    Candle { key: SeriesKey, candle: Candle },
    /// The series was refetched after a reconnect; close events resume with
    /// the first candle newer than what each subscriber already observed.
    Resync { key: SeriesKey },
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub channel_capacity: usize,
    pub retry_capacity: usize,
    pub candle_history: usize,
    pub reconnect_cap_secs: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1_024,
            retry_capacity: 256,
            candle_history: 300,
            reconnect_cap_secs: 60,
        }
    }
}

struct TickSub {
    name: String,
    tx: mpsc::Sender<Ticker>,
    dropped: u64,
}

struct CloseSub {
    name: String,
    tx: mpsc::Sender<CloseEvent>,
    retry: VecDeque<CloseEvent>,
    unhealthy: bool,
}

#[derive(Default)]
struct SubscriptionSet {
    symbols: BTreeSet<String>,
    timeframes: BTreeSet<String>,
}

pub struct MarketDataHub {
    store: Arc<MarketStore>,
    client: Arc<ExchangeClient>,
    cfg: HubConfig,

    desired: RwLock<SubscriptionSet>,
    resubscribe: Notify,

    tick_subs: Mutex<Vec<TickSub>>,
    close_subs: Mutex<Vec<CloseSub>>,

    /// Last emitted close-time per series; the source-level dedup line.
    last_emitted: Mutex<HashMap<SeriesKey, i64>>,

    active_conns: AtomicUsize,
    ticks_dropped_total: AtomicU64,
    skew_warned: AtomicBool,
}

impl MarketDataHub {
    pub fn new(store: Arc<MarketStore>, client: Arc<ExchangeClient>, cfg: HubConfig) -> Self {
        Self {
            store,
            client,
            cfg,
            desired: RwLock::new(SubscriptionSet::default()),
            resubscribe: Notify::new(),
            tick_subs: Mutex::new(Vec::new()),
            close_subs: Mutex::new(Vec::new()),
            last_emitted: Mutex::new(HashMap::new()),
            active_conns: AtomicUsize::new(0),
            ticks_dropped_total: AtomicU64::new(0),
            skew_warned: AtomicBool::new(false),
        }
    }

    // -------------------------------------------------------------------------
    // Subscription management
    // -------------------------------------------------------------------------

    /// Add symbols and timeframes to the union of active subscriptions.
    /// Idempotent; a change triggers an atomic resubscribe of the connection
    /// tasks.
    pub fn subscribe_symbols(&self, symbols: &[String], timeframes: &[String]) {
        let mut changed = false;
        {
            let mut desired = self.desired.write();
            for s in symbols {
                changed |= desired.symbols.insert(s.to_uppercase());
            }
            for tf in timeframes {
                changed |= desired.timeframes.insert(tf.clone());
            }
        }
        if changed {
            info!(
                symbols = symbols.len(),
                timeframes = timeframes.len(),
                "subscription set grew -- resubscribing"
            );
            self.resubscribe.notify_one();
        }
    }

    /// The coherent read-only view over current tickers and candle history.
    pub fn snapshot(&self) -> Arc<MarketStore> {
        self.store.clone()
    }

    /// Subscribe to every ticker update. Best-effort delivery.
    pub fn ticks(&self, name: impl Into<String>) -> mpsc::Receiver<Ticker> {
        let (tx, rx) = mpsc::channel(self.cfg.channel_capacity);
        self.tick_subs.lock().push(TickSub {
            name: name.into(),
            tx,
            dropped: 0,
        });
        rx
    }

    /// Subscribe to candle-close events. Guaranteed delivery per series in
    /// non-decreasing close-time order.
    pub fn candle_closes(&self, name: impl Into<String>) -> mpsc::Receiver<CloseEvent> {
        let (tx, rx) = mpsc::channel(self.cfg.channel_capacity);
        self.close_subs.lock().push(CloseSub {
            name: name.into(),
            tx,
            retry: VecDeque::new(),
            unhealthy: false,
        });
        rx
    }

    /// True while at least one upstream connection is established and no
    /// close subscriber has overflowed its retry buffer.
    pub fn healthy(&self) -> bool {
        self.active_conns.load(Ordering::Relaxed) > 0
            && !self.close_subs.lock().iter().any(|s| s.unhealthy)
    }

    /// Total tick events dropped across all subscribers since start.
    pub fn ticks_dropped(&self) -> u64 {
        self.ticks_dropped_total.load(Ordering::Relaxed)
    }

    // -------------------------------------------------------------------------
    // Event application (also the test seam -- no socket required)
    // -------------------------------------------------------------------------

    pub(crate) fn handle_wire_event(&self, event: WireEvent) {
        match event {
            WireEvent::Ticker(update) => {
                self.check_clock_skew(update.event_time);
                let merged = self.store.merge_ticker(update);
                self.publish_tick(merged);
            }
            WireEvent::Kline { key, candle } => {
                let apply = self.store.apply_candle(key.clone(), candle.clone());
                if apply == CandleApply::Closed {
                    self.emit_close_if_new(&key, candle);
                }
            }
        }
    }

    /// Emit a close event when `candle.close_time` advances past the last
    /// emitted close for the series. Duplicate finals are silently absorbed.
    fn emit_close_if_new(&self, key: &SeriesKey, candle: Candle) {
        {
            let mut emitted = self.last_emitted.lock();
            let last = emitted.get(key).copied().unwrap_or(i64::MIN);
            if candle.close_time <= last {
                debug!(series = %key, close_time = candle.close_time, "suppressing replayed candle close");
                return;
            }
            emitted.insert(key.clone(), candle.close_time);
        }
        self.publish_close(CloseEvent::Candle {
            key: key.clone(),
            candle,
        });
    }

    fn publish_tick(&self, ticker: Ticker) {
        let mut subs = self.tick_subs.lock();
        subs.retain_mut(|sub| match sub.tx.try_send(ticker.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                sub.dropped += 1;
                self.ticks_dropped_total.fetch_add(1, Ordering::Relaxed);
                if sub.dropped % 1_000 == 1 {
                    warn!(subscriber = %sub.name, dropped = sub.dropped, "tick subscriber lagging -- dropping");
                }
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(subscriber = %sub.name, "tick subscriber gone");
                false
            }
        });
    }

    fn publish_close(&self, event: CloseEvent) {
        let retry_cap = self.cfg.retry_capacity;
        let mut subs = self.close_subs.lock();
        subs.retain_mut(|sub| {
            // Drain any backlog first so per-series ordering holds.
            while let Some(pending) = sub.retry.front() {
                match sub.tx.try_send(pending.clone()) {
                    Ok(()) => {
                        sub.retry.pop_front();
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => break,
                    Err(mpsc::error::TrySendError::Closed(_)) => return false,
                }
            }

            if sub.retry.is_empty() {
                match sub.tx.try_send(event.clone()) {
                    Ok(()) => return true,
                    Err(mpsc::error::TrySendError::Closed(_)) => return false,
                    Err(mpsc::error::TrySendError::Full(_)) => {}
                }
            }

            // Channel (still) full: spill to the retry buffer.
            if sub.retry.len() < retry_cap {
                sub.retry.push_back(event.clone());
            } else if !sub.unhealthy {
                sub.unhealthy = true;
                error!(
                    subscriber = %sub.name,
                    buffered = sub.retry.len(),
                    "close subscriber retry buffer full -- marking unhealthy"
                );
            }
            true
        });
    }

    /// Re-deliver buffered close events to subscribers that have channel
    /// space again. Called periodically so backlog drains even when no new
    /// closes arrive.
    pub fn flush_retries(&self) {
        let mut subs = self.close_subs.lock();
        subs.retain_mut(|sub| {
            while let Some(pending) = sub.retry.front() {
                match sub.tx.try_send(pending.clone()) {
                    Ok(()) => {
                        sub.retry.pop_front();
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => break,
                    Err(mpsc::error::TrySendError::Closed(_)) => return false,
                }
            }
            true
        });
    }

    fn check_clock_skew(&self, event_time_ms: i64) {
        if event_time_ms == 0 {
            return;
        }
        let skew = (Utc::now().timestamp_millis() - event_time_ms).abs();
        if skew > CLOCK_SKEW_WARN_MS {
            if !self.skew_warned.swap(true, Ordering::Relaxed) {
                warn!(skew_ms = skew, "clock skew against exchange timestamps exceeds threshold");
            }
        } else {
            self.skew_warned.store(false, Ordering::Relaxed);
        }
    }

    // -------------------------------------------------------------------------
    // Resync / warm-up
    // -------------------------------------------------------------------------

    /// Refetch recent history for one series over REST.
    ///
    /// On the first load the series is seeded silently. On a reconnect a
    /// resync marker is emitted, then close events for exactly the candles
    /// whose close-time is newer than the last one emitted.
    async fn resync_series(&self, key: &SeriesKey) -> anyhow::Result<()> {
        let candles = self
            .client
            .get_klines(&key.symbol, &key.timeframe, self.cfg.candle_history as u32)
            .await?;

        let seeded = self.last_emitted.lock().contains_key(key);

        let mut newest_close = i64::MIN;
        let mut fresh: Vec<Candle> = Vec::new();
        {
            let last = self
                .last_emitted
                .lock()
                .get(key)
                .copied()
                .unwrap_or(i64::MIN);
            for candle in candles {
                if candle.is_closed {
                    newest_close = newest_close.max(candle.close_time);
                    if seeded && candle.close_time > last {
                        fresh.push(candle.clone());
                    }
                }
                self.store.apply_candle(key.clone(), candle);
            }
        }

        if !seeded {
            if newest_close > i64::MIN {
                self.last_emitted.lock().insert(key.clone(), newest_close);
            }
            debug!(series = %key, "series warmed up");
            return Ok(());
        }

        if !fresh.is_empty() {
            info!(series = %key, gap = fresh.len(), "resynced series -- emitting gap closes");
            self.publish_close(CloseEvent::Resync { key: key.clone() });
            fresh.sort_by_key(|c| c.close_time);
            for candle in fresh {
                self.emit_close_if_new(key, candle);
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Connection loop
    // -------------------------------------------------------------------------

    /// Drive the upstream connections until shutdown. Re-shards and
    /// reconnects whenever the subscription set changes.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let (symbols, timeframes) = {
                let desired = self.desired.read();
                (
                    desired.symbols.iter().cloned().collect::<Vec<_>>(),
                    desired.timeframes.iter().cloned().collect::<Vec<_>>(),
                )
            };

            let mut tasks = Vec::new();

            // Backlog flusher: drains per-subscriber retry buffers even when
            // the market is quiet.
            {
                let hub = self.clone();
                let mut sd = shutdown.clone();
                tasks.push(tokio::spawn(async move {
                    let mut iv =
                        tokio::time::interval(std::time::Duration::from_millis(100));
                    loop {
                        tokio::select! {
                            _ = sd.changed() => return,
                            _ = iv.tick() => hub.flush_retries(),
                        }
                    }
                }));
            }

            if !symbols.is_empty() && !timeframes.is_empty() {
                for shard in shard_symbols(&symbols, &timeframes) {
                    let hub = self.clone();
                    let tfs = timeframes.clone();
                    let sd = shutdown.clone();
                    tasks.push(tokio::spawn(async move {
                        hub.run_connection(shard, tfs, sd).await;
                    }));
                }
                info!(
                    connections = tasks.len(),
                    symbols = symbols.len(),
                    "market data connections launched"
                );
            }

            tokio::select! {
                _ = self.resubscribe.notified() => {
                    debug!("subscription change -- restarting connections");
                }
                _ = shutdown.changed() => {}
            }

            for t in &tasks {
                t.abort();
            }
            self.active_conns.store(0, Ordering::Relaxed);
        }
        info!("market data hub stopped");
    }

    async fn run_connection(
        self: Arc<Self>,
        symbols: Vec<String>,
        timeframes: Vec<String>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let url = build_stream_url(&symbols, &timeframes);
        let mut backoff_secs = 1u64;

        loop {
            if *shutdown.borrow() {
                return;
            }

            // Warm up / resync every series this connection carries before
            // frames start flowing, so subscribers never see a torn history.
            for sym in &symbols {
                for tf in &timeframes {
                    let key = SeriesKey::new(sym.clone(), tf.clone());
                    if let Err(e) = self.resync_series(&key).await {
                        warn!(series = %key, error = %e, "history refetch failed");
                    }
                }
            }

            match connect_async(&url).await {
                Ok((ws_stream, _resp)) => {
                    info!(streams = symbols.len() * (1 + timeframes.len()), "stream connected");
                    self.active_conns.fetch_add(1, Ordering::Relaxed);
                    backoff_secs = 1;

                    let (_write, mut read) = ws_stream.split();
                    loop {
                        tokio::select! {
                            _ = shutdown.changed() => {
                                self.active_conns.fetch_sub(1, Ordering::Relaxed);
                                return;
                            }
                            msg = read.next() => match msg {
                                Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                                    match parse_frame(&text) {
                                        Ok(Some(event)) => self.handle_wire_event(event),
                                        Ok(None) => {}
                                        Err(e) => warn!(error = %e, "unparseable stream frame"),
                                    }
                                }
                                // Ping/pong/binary frames are handled by the
                                // transport; close falls through to reconnect.
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    error!(error = %e, "stream read error");
                                    break;
                                }
                                None => {
                                    warn!("stream ended");
                                    break;
                                }
                            }
                        }
                    }
                    self.active_conns.fetch_sub(1, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!(error = %e, backoff_secs, "stream connect failed");
                }
            }

            tokio::time::sleep(std::time::Duration::from_secs(backoff_secs)).await;
            backoff_secs = (backoff_secs * 2).min(self.cfg.reconnect_cap_secs);
        }
    }
}

/// Split the symbol set into chunks that fit the per-connection stream limit.
fn shard_symbols(symbols: &[String], timeframes: &[String]) -> Vec<Vec<String>> {
    let per_symbol = 1 + timeframes.len();
    let chunk = (MAX_STREAMS_PER_CONN / per_symbol).max(1);
    symbols.chunks(chunk).map(|c| c.to_vec()).collect()
}

// ---------------------------------------------------------------------------
// Tests (socket-free, through the wire-event seam)
// ---------------------------------------------------------------------------
