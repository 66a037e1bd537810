// =============================================================================
// Relative Strength Index -- Wilder's smoothing
// =============================================================================
//
// Seed the average gain/loss with the SMA of the first `period` deltas, then
// apply Wilder's exponential smoothing:
//
//   avg_gain = (prev_avg_gain * (period - 1) + gain) / period
//   avg_loss = (prev_avg_loss * (period - 1) + loss) / period
//   RSI      = 100 - 100 / (1 + avg_gain / avg_loss)
//
// A window with zero average loss yields RSI = 100. This includes a perfectly
// flat window; the engine's cross-backend contract pins that case to 100
// rather than the "50 on no movement" convention some libraries use.
// =============================================================================

/// Most recent RSI value over `closes`.
///
/// Returns `None` when `period == 0` or fewer than `period + 1` closes exist
/// (the first `period` deltas seed the averages).
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }

    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();

    let (sum_gain, sum_loss) = deltas[..period]
        .iter()
        .fold((0.0_f64, 0.0_f64), |(g, l), &d| {
            if d > 0.0 {
                (g + d, l)
            } else {
                (g, l + d.abs())
            }
        });

    let period_f = period as f64;
    let mut avg_gain = sum_gain / period_f;
    let mut avg_loss = sum_loss / period_f;

    for &delta in &deltas[period..] {
        let gain = if delta > 0.0 { delta } else { 0.0 };
        let loss = if delta < 0.0 { delta.abs() } else { 0.0 };
        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;
    }

    let value = if avg_loss == 0.0 {
        100.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    };

    value.is_finite().then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_data() {
        assert!(rsi(&[], 14).is_none());
        assert!(rsi(&[1.0; 14], 14).is_none()); // need period + 1
        assert!(rsi(&[1.0, 2.0, 3.0], 0).is_none());
    }

    #[test]
    fn all_gains_is_100() {
        let closes: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        let v = rsi(&closes, 14).unwrap();
        assert!((v - 100.0).abs() < 1e-10, "expected 100, got {v}");
    }

    #[test]
    fn all_losses_is_0() {
        let closes: Vec<f64> = (1..=30).rev().map(|x| x as f64).collect();
        let v = rsi(&closes, 14).unwrap();
        assert!(v.abs() < 1e-10, "expected 0, got {v}");
    }

    #[test]
    fn no_loss_window_is_100() {
        // Flat window: zero average loss pins RSI to 100.
        let closes = vec![100.0; 30];
        let v = rsi(&closes, 14).unwrap();
        assert!((v - 100.0).abs() < 1e-10, "expected 100, got {v}");
    }

    #[test]
    fn range_check() {
        let closes = vec![
            44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08, 45.89, 46.03,
            44.18, 44.22, 44.57, 43.42, 42.66, 43.13,
        ];
        let v = rsi(&closes, 14).unwrap();
        assert!((0.0..=100.0).contains(&v), "RSI {v} out of range");
    }

    #[test]
    fn deterministic() {
        let closes: Vec<f64> = (0..50).map(|x| ((x * 37) % 13) as f64 + 10.0).collect();
        assert_eq!(rsi(&closes, 14), rsi(&closes, 14));
    }
}
