// -----------------------------------------------------------------------------
// Wire parsing for the exchange combined stream
// -----------------------------------------------------------------------------
//
// One combined-stream socket carries `{symbol}@ticker` and
// `{symbol}@kline_{tf}` subscriptions. Kline frames carry numeric values as
// JSON strings and millisecond timestamps; the `x` flag marks candle close.
// -----------------------------------------------------------------------------

use anyhow::{Context, Result};

use crate::types::{Candle, SeriesKey};

use super::store::TickerUpdate;

/// Base URL for the exchange combined stream.
const STREAM_BASE: &str = "wss://stream.binance.com:9443/stream?streams=";

/// Maximum stream names multiplexed onto one socket; beyond this the hub
/// shards across connections.
pub const MAX_STREAMS_PER_CONN: usize = 200;

/// One parsed frame from the combined stream.
#[derive(Debug, Clone)]
pub enum WireEvent {
    Kline { key: SeriesKey, candle: Candle },
    Ticker(TickerUpdate),
}

/// Build the combined-stream URL for the given subscription set.
pub fn build_stream_url(symbols: &[String], timeframes: &[String]) -> String {
    let mut streams: Vec<String> = Vec::new();
    for sym in symbols {
        let lower = sym.to_lowercase();
        streams.push(format!("{lower}@ticker"));
        for tf in timeframes {
            streams.push(format!("{lower}@kline_{tf}"));
        }
    }
    format!("{STREAM_BASE}{}", streams.join("/"))
}

/// Number of stream names the subscription set occupies.
pub fn stream_count(symbols: &[String], timeframes: &[String]) -> usize {
    symbols.len() * (1 + timeframes.len())
}

/// Parse one text frame. Returns `Ok(None)` for frames that carry no market
/// data (subscription acks, unknown event types).
pub fn parse_frame(text: &str) -> Result<Option<WireEvent>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse stream JSON")?;

    // Combined-stream envelope: { "stream": "...", "data": { ... } };
    // tolerate direct single-stream payloads as well.
    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };

    match data["e"].as_str() {
        Some("kline") => parse_kline(data).map(Some),
        Some("24hrTicker") => parse_ticker(data).map(Some),
        _ => Ok(None),
    }
}

fn parse_kline(data: &serde_json::Value) -> Result<WireEvent> {
    let symbol = data["s"]
        .as_str()
        .context("missing field s")?
        .to_uppercase();

    let k = &data["k"];
    let timeframe = k["i"].as_str().context("missing field k.i")?.to_string();

    let candle = Candle {
        open_time: k["t"].as_i64().context("missing field k.t")?,
        close_time: k["T"].as_i64().context("missing field k.T")?,
        open: parse_string_f64(&k["o"], "k.o")?,
        high: parse_string_f64(&k["h"], "k.h")?,
        low: parse_string_f64(&k["l"], "k.l")?,
        close: parse_string_f64(&k["c"], "k.c")?,
        volume: parse_string_f64(&k["v"], "k.v")?,
        quote_volume: parse_string_f64(&k["q"], "k.q")?,
        is_closed: k["x"].as_bool().context("missing field k.x")?,
    };

    Ok(WireEvent::Kline {
        key: SeriesKey { symbol, timeframe },
        candle,
    })
}

fn parse_ticker(data: &serde_json::Value) -> Result<WireEvent> {
    let symbol = data["s"]
        .as_str()
        .context("missing field s")?
        .to_uppercase();

    let update = TickerUpdate {
        symbol,
        last_price: opt_string_f64(&data["c"]),
        change_pct_24h: opt_string_f64(&data["P"]),
        quote_volume_24h: opt_string_f64(&data["q"]),
        event_time: data["E"].as_i64().unwrap_or(0),
    };

    Ok(WireEvent::Ticker(update))
}

/// The exchange sends numeric values as JSON strings inside event payloads.
fn parse_string_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

fn opt_string_f64(val: &serde_json::Value) -> Option<f64> {
    match val {
        serde_json::Value::String(s) => s.parse::<f64>().ok(),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_contains_ticker_and_kline_streams() {
        let url = build_stream_url(
            &["BTCUSDT".to_string()],
            &["1m".to_string(), "5m".to_string()],
        );
        assert!(url.starts_with(STREAM_BASE));
        assert!(url.contains("btcusdt@ticker"));
        assert!(url.contains("btcusdt@kline_1m"));
        assert!(url.contains("btcusdt@kline_5m"));
    }

    #[test]
    fn stream_count_includes_ticker() {
        let syms = vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()];
        let tfs = vec!["1m".to_string()];
        assert_eq!(stream_count(&syms, &tfs), 4);
    }

    #[test]
    fn parse_kline_frame() {
        let json = r#"{
            "stream": "btcusdt@kline_1m",
            "data": {
                "e": "kline",
                "E": 1700000050000,
                "s": "BTCUSDT",
                "k": {
                    "t": 1700000000000,
                    "T": 1700000059999,
                    "i": "1m",
                    "o": "37000.00",
                    "h": "37050.00",
                    "l": "36990.00",
                    "c": "37020.00",
                    "v": "123.456",
                    "q": "4567890.12",
                    "x": true
                }
            }
        }"#;
        match parse_frame(json).unwrap() {
            Some(WireEvent::Kline { key, candle }) => {
                assert_eq!(key.symbol, "BTCUSDT");
                assert_eq!(key.timeframe, "1m");
                assert!(candle.is_closed);
                assert!((candle.close - 37_020.0).abs() < f64::EPSILON);
                assert_eq!(candle.close_time, 1_700_000_059_999);
            }
            other => panic!("unexpected parse result: {other:?}"),
        }
    }

    #[test]
    fn parse_ticker_frame() {
        let json = r#"{
            "stream": "ethusdt@ticker",
            "data": {
                "e": "24hrTicker",
                "E": 1700000050000,
                "s": "ETHUSDT",
                "c": "2000.5",
                "P": "-1.25",
                "q": "987654321.0"
            }
        }"#;
        match parse_frame(json).unwrap() {
            Some(WireEvent::Ticker(t)) => {
                assert_eq!(t.symbol, "ETHUSDT");
                assert_eq!(t.last_price, Some(2_000.5));
                assert_eq!(t.change_pct_24h, Some(-1.25));
                assert_eq!(t.event_time, 1_700_000_050_000);
            }
            other => panic!("unexpected parse result: {other:?}"),
        }
    }

    #[test]
    fn non_data_frame_is_none() {
        let json = r#"{"result": null, "id": 1}"#;
        assert!(parse_frame(json).unwrap().is_none());
    }

    #[test]
    fn malformed_kline_is_error() {
        let json = r#"{"data": {"e": "kline", "s": "BTCUSDT", "k": {"i": "1m"}}}"#;
        assert!(parse_frame(json).is_err());
    }
}
