// =============================================================================
// Stochastic Oscillator
// =============================================================================
//
// %K = 100 * (close - lowest_low(k)) / (highest_high(k) - lowest_low(k))
// %D = SMA(d) of the %K series
// =============================================================================

use crate::types::Candle;

use super::moving::sma;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stochastic {
    pub k: f64,
    pub d: f64,
}

/// Most recent stochastic reading.
///
/// Needs `k_period + d_period - 1` candles to produce `d_period` points of
/// the %K series; a zero high-low range anywhere in that window yields `None`.
pub fn stochastic(candles: &[Candle], k_period: usize, d_period: usize) -> Option<Stochastic> {
    if k_period == 0 || d_period == 0 || candles.len() < k_period + d_period - 1 {
        return None;
    }

    let mut k_series = Vec::with_capacity(d_period);
    let start = candles.len() - (k_period + d_period - 1);
    for i in 0..d_period {
        let window = &candles[start + i..start + i + k_period];
        let high = window.iter().map(|c| c.high).fold(f64::MIN, f64::max);
        let low = window.iter().map(|c| c.low).fold(f64::MAX, f64::min);
        let range = high - low;
        if range <= 0.0 {
            return None;
        }
        let close = window.last()?.close;
        k_series.push(100.0 * (close - low) / range);
    }

    let k = *k_series.last()?;
    let d = sma(&k_series, d_period)?;

    (k.is_finite() && d.is_finite()).then_some(Stochastic { k, d })
}
