// =============================================================================
// Shared types used across the Meridian screener engine
// =============================================================================

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Timeframes
// ---------------------------------------------------------------------------

/// Exchange timeframe labels the engine understands, in ascending order.
pub const SUPPORTED_TIMEFRAMES: &[&str] =
    &["1m", "3m", "5m", "15m", "30m", "1h", "2h", "4h", "1d"];

/// Duration of one candle of the given timeframe, in milliseconds.
///
/// Returns `None` for labels the exchange does not stream.
pub fn timeframe_ms(tf: &str) -> Option<i64> {
    let ms = match tf {
        "1m" => 60_000,
        "3m" => 180_000,
        "5m" => 300_000,
        "15m" => 900_000,
        "30m" => 1_800_000,
        "1h" => 3_600_000,
        "2h" => 7_200_000,
        "4h" => 14_400_000,
        "1d" => 86_400_000,
        _ => return None,
    };
    Some(ms)
}

// ---------------------------------------------------------------------------
// Market data records
// ---------------------------------------------------------------------------

/// A single OHLCV candle for one (symbol, timeframe) series.
///
/// A candle may be updated in place while `is_closed == false`; once closed it
/// is immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub quote_volume: f64,
    pub is_closed: bool,
}

/// Composite key identifying one candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SeriesKey {
    pub symbol: String,
    pub timeframe: String,
}

impl SeriesKey {
    pub fn new(symbol: impl Into<String>, timeframe: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe: timeframe.into(),
        }
    }
}

impl std::fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.timeframe)
    }
}

/// Last-known ticker state for one symbol. Always complete: partial wire
/// updates are merged into the previous record before publication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub last_price: f64,
    pub change_pct_24h: f64,
    pub quote_volume_24h: f64,
    /// Exchange event time, milliseconds since epoch.
    pub updated_at: i64,
}

/// Point-in-time read-only bundle handed to a single strategy evaluation.
///
/// Candle slices are most-recent-last and contain only closed candles.
#[derive(Debug, Clone)]
pub struct MarketView {
    pub symbol: String,
    pub ticker: Ticker,
    pub candles: HashMap<String, Vec<Candle>>,
    /// Close time of the candle whose close triggered this evaluation.
    pub close_time: i64,
    /// Timeframe that triggered this evaluation.
    pub timeframe: String,
}

impl MarketView {
    /// Closed candles for `tf`, most-recent-last. Empty slice when the
    /// timeframe was not part of the bundle.
    pub fn series(&self, tf: &str) -> &[Candle] {
        self.candles.get(tf).map(Vec::as_slice).unwrap_or(&[])
    }
}

// ---------------------------------------------------------------------------
// Positions
// ---------------------------------------------------------------------------

/// Direction of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "long" => Ok(Self::Long),
            "short" => Ok(Self::Short),
            other => Err(format!("unknown side '{other}'")),
        }
    }
}

/// Position lifecycle. Transitions are open -> closing -> closed, each via
/// compare-and-swap so exactly one observer wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closing,
    Closed,
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

impl std::str::FromStr for PositionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "closing" => Ok(Self::Closing),
            "closed" => Ok(Self::Closed),
            other => Err(format!("unknown position status '{other}'")),
        }
    }
}

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    Manual,
    Liquidation,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StopLoss => write!(f, "stop_loss"),
            Self::TakeProfit => write!(f, "take_profit"),
            Self::Manual => write!(f, "manual"),
            Self::Liquidation => write!(f, "liquidation"),
        }
    }
}

impl std::str::FromStr for ExitReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stop_loss" => Ok(Self::StopLoss),
            "take_profit" => Ok(Self::TakeProfit),
            "manual" => Ok(Self::Manual),
            "liquidation" => Ok(Self::Liquidation),
            other => Err(format!("unknown exit reason '{other}'")),
        }
    }
}

/// A tracked trade, open or historical.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub tenant_id: String,
    pub strategy_id: String,
    #[serde(default)]
    pub signal_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub quantity: f64,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    pub status: PositionStatus,
    #[serde(default)]
    pub exit_price: Option<f64>,
    #[serde(default)]
    pub exit_reason: Option<ExitReason>,
    #[serde(default)]
    pub realized_pnl: Option<f64>,
    pub opened_at: i64,
    #[serde(default)]
    pub closed_at: Option<i64>,
}

impl Position {
    /// Validate the SL/TP bracket against the entry price: for longs the
    /// stop must sit below entry and the target above, reversed for shorts.
    pub fn validate_bracket(&self) -> Result<(), String> {
        match self.side {
            Side::Long => {
                if let Some(sl) = self.stop_loss {
                    if sl >= self.entry_price {
                        return Err(format!(
                            "long stop-loss {sl} must be below entry {}",
                            self.entry_price
                        ));
                    }
                }
                if let Some(tp) = self.take_profit {
                    if tp <= self.entry_price {
                        return Err(format!(
                            "long take-profit {tp} must be above entry {}",
                            self.entry_price
                        ));
                    }
                }
            }
            Side::Short => {
                if let Some(sl) = self.stop_loss {
                    if sl <= self.entry_price {
                        return Err(format!(
                            "short stop-loss {sl} must be above entry {}",
                            self.entry_price
                        ));
                    }
                }
                if let Some(tp) = self.take_profit {
                    if tp >= self.entry_price {
                        return Err(format!(
                            "short take-profit {tp} must be below entry {}",
                            self.entry_price
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// Where a signal was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceLabel {
    Cloud,
    Local,
}

impl std::fmt::Display for SourceLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cloud => write!(f, "cloud"),
            Self::Local => write!(f, "local"),
        }
    }
}

/// A persisted strategy match. Identity is (strategy_id, symbol, close_time);
/// the record is never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    pub strategy_id: String,
    pub tenant_id: String,
    pub symbol: String,
    /// Candle close time that produced the match, milliseconds since epoch.
    pub close_time: i64,
    pub price: f64,
    pub quote_volume: f64,
    pub source: SourceLabel,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created_at: i64,
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

/// Strategy lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyState {
    Stopped,
    Starting,
    Running,
    Errored,
}

impl std::fmt::Display for StrategyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Errored => write!(f, "errored"),
        }
    }
}

impl std::str::FromStr for StrategyState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stopped" => Ok(Self::Stopped),
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "errored" => Ok(Self::Errored),
            other => Err(format!("unknown strategy state '{other}'")),
        }
    }
}

/// A user-authored strategy as stored. The source text is compiled by the
/// sandbox before the strategy can run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyDef {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub source: String,
    /// Explicit symbols; empty means "follow the top-N volume set".
    #[serde(default)]
    pub symbols: Vec<String>,
    /// Timeframes the strategy reads; the first entry is the primary
    /// (scheduling) timeframe.
    pub timeframes: Vec<String>,
    /// Max signals forwarded per scheduled tick.
    #[serde(default = "default_signal_cap")]
    pub signal_cap: u32,
    /// Per-evaluation wall-clock deadline, milliseconds.
    #[serde(default = "default_deadline_ms")]
    pub deadline_ms: u64,
    pub state: StrategyState,
    /// Human-readable reason for the current state (compile error text,
    /// quota refusal); surfaced to the control plane.
    #[serde(default)]
    pub state_reason: Option<String>,
    #[serde(default)]
    pub error_count: u32,
    /// Optimistic concurrency column for state CAS.
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub last_eval_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

fn default_signal_cap() -> u32 {
    10
}

fn default_deadline_ms() -> u64 {
    5_000
}

impl StrategyDef {
    /// The timeframe whose candle closes drive this strategy's checks.
    pub fn primary_timeframe(&self) -> &str {
        self.timeframes.first().map(String::as_str).unwrap_or("1m")
    }

    /// Whether this strategy follows the top-N volume set.
    pub fn follows_top_volume(&self) -> bool {
        self.symbols.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tenants
// ---------------------------------------------------------------------------

/// Per-tenant limits, read-only to the scheduler. Changes take effect on the
/// next scheduler tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantQuota {
    pub tenant_id: String,
    pub max_active_strategies: u32,
    pub max_concurrent_evals: u32,
    /// Higher classes are admitted first within a tick.
    pub priority_class: u8,
    /// Size of the top-volume set this tenant's unpinned strategies follow.
    #[serde(default = "default_top_n")]
    pub top_n: usize,
}

fn default_top_n() -> usize {
    100
}

impl Default for TenantQuota {
    fn default() -> Self {
        Self {
            tenant_id: String::new(),
            max_active_strategies: 10,
            max_concurrent_evals: 4,
            priority_class: 0,
            top_n: default_top_n(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeframe_ms_known_labels() {
        assert_eq!(timeframe_ms("1m"), Some(60_000));
        assert_eq!(timeframe_ms("1h"), Some(3_600_000));
        assert_eq!(timeframe_ms("1d"), Some(86_400_000));
    }

    #[test]
    fn timeframe_ms_unknown_label() {
        assert_eq!(timeframe_ms("7m"), None);
        assert_eq!(timeframe_ms(""), None);
    }

    #[test]
    fn long_bracket_validation() {
        let mut pos = sample_position(Side::Long, 2_000.0);
        pos.stop_loss = Some(1_990.0);
        pos.take_profit = Some(2_020.0);
        assert!(pos.validate_bracket().is_ok());

        pos.stop_loss = Some(2_010.0);
        assert!(pos.validate_bracket().is_err());
    }

    #[test]
    fn short_bracket_validation() {
        let mut pos = sample_position(Side::Short, 2_000.0);
        pos.stop_loss = Some(2_010.0);
        pos.take_profit = Some(1_980.0);
        assert!(pos.validate_bracket().is_ok());

        pos.take_profit = Some(2_100.0);
        assert!(pos.validate_bracket().is_err());
    }

    #[test]
    fn primary_timeframe_falls_back() {
        let mut def = sample_strategy();
        assert_eq!(def.primary_timeframe(), "5m");
        def.timeframes.clear();
        assert_eq!(def.primary_timeframe(), "1m");
    }

    fn sample_position(side: Side, entry: f64) -> Position {
        Position {
            id: "p1".into(),
            tenant_id: "t1".into(),
            strategy_id: "s1".into(),
            signal_id: None,
            symbol: "ETHUSDT".into(),
            side,
            entry_price: entry,
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

    fn sample_strategy() -> StrategyDef {
        StrategyDef {
            id: "s1".into(),
            tenant_id: "t1".into(),
            name: "test".into(),
            source: "return true".into(),
            symbols: vec!["BTCUSDT".into()],
            timeframes: vec!["5m".into(), "1h".into()],
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
}
