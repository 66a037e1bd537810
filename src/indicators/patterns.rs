// =============================================================================
// Candlestick pattern detectors
// =============================================================================

use crate::types::Candle;

/// Engulfing pattern classification over the last two candles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engulfing {
    Bullish,
    Bearish,
    None,
}

impl std::fmt::Display for Engulfing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bullish => write!(f, "bullish"),
            Self::Bearish => write!(f, "bearish"),
            Self::None => write!(f, "none"),
        }
    }
}

/// Detect an engulfing pattern on the most recent candle pair.
///
/// Bullish: previous candle closed down, current closed up, and the current
/// body strictly contains the previous body. Bearish is the mirror image.
/// Fewer than two candles, or no engulfment, yields `Engulfing::None`.
pub fn engulfing(candles: &[Candle]) -> Engulfing {
    let n = candles.len();
    if n < 2 {
        return Engulfing::None;
    }
    let prev = &candles[n - 2];
    let cur = &candles[n - 1];

    let prev_down = prev.close < prev.open;
    let prev_up = prev.close > prev.open;
    let cur_down = cur.close < cur.open;
    let cur_up = cur.close > cur.open;

    if prev_down && cur_up && cur.open < prev.close && cur.close > prev.open {
        return Engulfing::Bullish;
    }
    if prev_up && cur_down && cur.open > prev.close && cur.close < prev.open {
        return Engulfing::Bearish;
    }
    Engulfing::None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open: f64, close: f64) -> Candle {
        Candle {
            open_time: 0,
            close_time: 0,
            open,
            high: open.max(close) + 0.5,
            low: open.min(close) - 0.5,
            close,
            volume: 1.0,
            quote_volume: 1.0,
            is_closed: true,
        }
    }

    #[test]
    fn too_few_candles() {
        assert_eq!(engulfing(&[]), Engulfing::None);
        assert_eq!(engulfing(&[candle(10.0, 11.0)]), Engulfing::None);
    }

    #[test]
    fn bullish_engulfing() {
        // Down candle 10 -> 9.5, then up candle 9.4 -> 10.2 engulfing it.
        let candles = vec![candle(10.0, 9.5), candle(9.4, 10.2)];
        assert_eq!(engulfing(&candles), Engulfing::Bullish);
    }

    #[test]
    fn bearish_engulfing() {
        let candles = vec![candle(9.5, 10.0), candle(10.1, 9.3)];
        assert_eq!(engulfing(&candles), Engulfing::Bearish);
    }

    #[test]
    fn same_direction_is_none() {
        let candles = vec![candle(9.0, 10.0), candle(9.5, 10.5)];
        assert_eq!(engulfing(&candles), Engulfing::None);
    }

    #[test]
    fn partial_cover_is_none() {
        // Up candle does not fully contain the previous body.
        let candles = vec![candle(10.0, 9.5), candle(9.6, 10.2)];
        assert_eq!(engulfing(&candles), Engulfing::None);
    }

    #[test]
    fn only_last_pair_considered() {
        let candles = vec![
            candle(10.0, 9.5),
            candle(9.4, 10.2), // bullish vs its predecessor
            candle(10.0, 10.1),
        ];
        assert_eq!(engulfing(&candles), Engulfing::None);
    }
}
