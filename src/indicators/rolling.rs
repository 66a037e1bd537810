// =============================================================================
// Rolling window extrema and volume
// =============================================================================

use crate::types::Candle;

/// Highest high over the last `period` candles.
pub fn highest_high(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period {
        return None;
    }
    let v = candles[candles.len() - period..]
        .iter()
        .map(|c| c.high)
        .fold(f64::MIN, f64::max);
    v.is_finite().then_some(v)
}

/// Lowest low over the last `period` candles.
pub fn lowest_low(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period {
        return None;
    }
    let v = candles[candles.len() - period..]
        .iter()
        .map(|c| c.low)
        .fold(f64::MAX, f64::min);
    v.is_finite().then_some(v)
}

/// Average base volume over the last `period` candles.
pub fn avg_volume(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period {
        return None;
    }
    let sum: f64 = candles[candles.len() - period..]
        .iter()
        .map(|c| c.volume)
        .sum();
    let avg = sum / period as f64;
    avg.is_finite().then_some(avg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(high: f64, low: f64, volume: f64) -> Candle {
        Candle {
            open_time: 0,
            close_time: 0,
            open: low,
            high,
            low,
            close: high,
            volume,
            quote_volume: 0.0,
            is_closed: true,
        }
    }

    #[test]
    fn insufficient_data() {
        let candles = vec![candle(2.0, 1.0, 5.0)];
        assert!(highest_high(&candles, 2).is_none());
        assert!(lowest_low(&candles, 2).is_none());
        assert!(avg_volume(&candles, 0).is_none());
    }

    #[test]
    fn extrema_respect_the_window() {
        let candles = vec![
            candle(100.0, 1.0, 1.0), // outside the window
            candle(10.0, 5.0, 2.0),
            candle(12.0, 6.0, 4.0),
        ];
        assert_eq!(highest_high(&candles, 2), Some(12.0));
        assert_eq!(lowest_low(&candles, 2), Some(5.0));
        assert_eq!(avg_volume(&candles, 2), Some(3.0));
    }

    #[test]
    fn full_slice_window() {
        let candles = vec![candle(3.0, 1.0, 6.0), candle(5.0, 2.0, 2.0)];
        assert_eq!(highest_high(&candles, 2), Some(5.0));
        assert_eq!(lowest_low(&candles, 2), Some(1.0));
        assert_eq!(avg_volume(&candles, 2), Some(4.0));
    }
}
