// =============================================================================
// Average True Range -- Wilder's smoothing over true ranges
// =============================================================================
//
// TR_i  = max(high - low, |high - prev_close|, |low - prev_close|)
// ATR   = Wilder-smoothed TR over `period`
// =============================================================================

use crate::types::Candle;

/// Most recent ATR over `candles`.
///
/// Needs at least `period + 1` candles (one extra for the previous close that
/// seeds the first true range); returns `None` otherwise.
pub fn atr(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }

    let trs: Vec<f64> = candles
        .windows(2)
        .map(|w| {
            let prev_close = w[0].close;
            let c = &w[1];
            let hl = c.high - c.low;
            let hc = (c.high - prev_close).abs();
            let lc = (c.low - prev_close).abs();
            hl.max(hc).max(lc)
        })
        .collect();

    let period_f = period as f64;
    let mut value = trs[..period].iter().sum::<f64>() / period_f;
    for &tr in &trs[period..] {
        value = (value * (period_f - 1.0) + tr) / period_f;
    }

    (value.is_finite() && value >= 0.0).then_some(value)
}
