// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free functions over candle slices. Every public function
// returns `Option<T>` (or an empty series) when given fewer candles than its
// lookback requires; none of them panic. All arithmetic is 64-bit float so
// the same strategy source produces identical matches on every backend.

pub mod atr;
pub mod bollinger;
pub mod macd;
pub mod moving;
pub mod patterns;
pub mod rolling;
pub mod rsi;
pub mod stochastic;
pub mod vwap;

pub use atr::atr;
pub use bollinger::{bollinger, Bollinger};
pub use macd::{macd, Macd};
pub use moving::{ema, ema_series, sma, sma_series};
pub use patterns::{engulfing, Engulfing};
pub use rolling::{avg_volume, highest_high, lowest_low};
pub use rsi::rsi;
pub use stochastic::{stochastic, Stochastic};
pub use vwap::vwap;

use crate::types::Candle;

/// Extract close prices from a candle slice, oldest-first.
pub fn closes(candles: &[Candle]) -> Vec<f64> {
    candles.iter().map(|c| c.close).collect()
}
