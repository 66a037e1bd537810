// =============================================================================
// Volume-Weighted Average Price
// =============================================================================

use crate::types::Candle;

/// VWAP over the supplied slice: sum(typical * volume) / sum(volume), where
/// typical = (high + low + close) / 3.
///
/// Returns `None` for an empty slice or zero total volume.
pub fn vwap(candles: &[Candle]) -> Option<f64> {
    if candles.is_empty() {
        return None;
    }

    let mut pv = 0.0_f64;
    let mut vol = 0.0_f64;
    for c in candles {
        let typical = (c.high + c.low + c.close) / 3.0;
        pv += typical * c.volume;
        vol += c.volume;
    }

    if vol <= 0.0 {
        return None;
    }
    let value = pv / vol;
    value.is_finite().then_some(value)
}
