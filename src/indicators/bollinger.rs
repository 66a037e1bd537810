// =============================================================================
// Bollinger Bands
// =============================================================================
//
// middle = SMA(period)
// upper  = middle + k * stddev(period)     (population standard deviation)
// lower  = middle - k * stddev(period)
// =============================================================================

use super::moving::sma;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bollinger {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

/// Most recent Bollinger bands over `closes`.
///
/// Returns `None` for `period == 0`, insufficient data, or a non-positive `k`.
pub fn bollinger(closes: &[f64], period: usize, k: f64) -> Option<Bollinger> {
    if period == 0 || closes.len() < period || k <= 0.0 || !k.is_finite() {
        return None;
    }

    let middle = sma(closes, period)?;
    let window = &closes[closes.len() - period..];
    let variance =
        window.iter().map(|v| (v - middle).powi(2)).sum::<f64>() / period as f64;
    let stddev = variance.sqrt();

    let upper = middle + k * stddev;
    let lower = middle - k * stddev;

    (upper.is_finite() && lower.is_finite()).then_some(Bollinger {
        upper,
        middle,
        lower,
    })
}
