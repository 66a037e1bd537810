// =============================================================================
// Moving Average Convergence Divergence
// =============================================================================
//
// macd      = EMA(fast) - EMA(slow)
// signal    = EMA(signal_period) of the macd line
// histogram = macd - signal
// =============================================================================

use super::moving::ema_series;

/// One MACD reading (the most recent point of each line).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Macd {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Most recent MACD over `closes`.
///
/// Requires `fast < slow` and enough closes to seed the slow EMA plus
/// `signal_period` points of the macd line; returns `None` otherwise.
pub fn macd(closes: &[f64], fast: usize, slow: usize, signal_period: usize) -> Option<Macd> {
    if fast == 0 || signal_period == 0 || fast >= slow {
        return None;
    }
    if closes.len() < slow + signal_period {
        return None;
    }

    let fast_series = ema_series(closes, fast);
    let slow_series = ema_series(closes, slow);
    if slow_series.is_empty() {
        return None;
    }

    // Align the two EMA series on their tails: both end at the last close.
    let line: Vec<f64> = fast_series
        .iter()
        .rev()
        .zip(slow_series.iter().rev())
        .map(|(f, s)| f - s)
        .collect::<Vec<f64>>()
        .into_iter()
        .rev()
        .collect();

    let signal_series = ema_series(&line, signal_period);
    let signal = *signal_series.last()?;
    let macd = *line.last()?;
    let histogram = macd - signal;

    (macd.is_finite() && signal.is_finite()).then_some(Macd {
        macd,
        signal,
        histogram,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_data() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        assert!(macd(&closes, 12, 26, 9).is_none());
    }

    #[test]
    fn degenerate_periods() {
        let closes: Vec<f64> = (1..=60).map(|x| x as f64).collect();
        assert!(macd(&closes, 26, 12, 9).is_none()); // fast >= slow
        assert!(macd(&closes, 0, 26, 9).is_none());
        assert!(macd(&closes, 12, 26, 0).is_none());
    }

    #[test]
    fn histogram_is_macd_minus_signal() {
        let closes: Vec<f64> = (0..80)
            .map(|x| 100.0 + (x as f64 * 0.7).sin() * 5.0)
            .collect();
        let m = macd(&closes, 12, 26, 9).unwrap();
        assert!((m.histogram - (m.macd - m.signal)).abs() < 1e-12);
    }

    #[test]
    fn rising_series_has_positive_macd() {
        let closes: Vec<f64> = (1..=80).map(|x| x as f64).collect();
        let m = macd(&closes, 12, 26, 9).unwrap();
        assert!(m.macd > 0.0);
    }

    #[test]
    fn flat_series_is_zero() {
        let closes = vec![42.0; 80];
        let m = macd(&closes, 12, 26, 9).unwrap();
        assert!(m.macd.abs() < 1e-12);
        assert!(m.signal.abs() < 1e-12);
        assert!(m.histogram.abs() < 1e-12);
    }
}
