// =============================================================================
// Exchange REST client -- HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. Signed requests
// carry X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift against the exchange.
//
// Every call passes through the shared process-wide rate limiter first.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::types::{Candle, Ticker};

use super::rate_limit::RateLimiter;

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5_000;

/// Raw order acknowledgement from the exchange.
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: u64,
    /// Quantity the exchange actually filled; may be below the requested
    /// quantity on a partial fill.
    pub executed_qty: f64,
    /// Volume-weighted fill price when derivable, else the order price.
    pub fill_price: f64,
    pub status: String,
}

/// Exchange REST client with request signing and shared rate limiting.
pub struct ExchangeClient {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
    limits: Arc<RateLimiter>,
}

impl ExchangeClient {
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        limits: Arc<RateLimiter>,
    ) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_key,
            secret,
            base_url: "https://api.binance.com".to_string(),
            client,
            limits,
        }
    }

    /// Override the REST base URL (test servers).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = Utc::now().timestamp_millis();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Public market data
    // -------------------------------------------------------------------------

    /// GET /api/v3/klines (public). Candles come back oldest-first; the
    /// trailing entry may still be in progress and is flagged accordingly.
    pub async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<Candle>> {
        self.limits.acquire(2).await;

        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, interval, limit
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/klines request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse klines response")?;

        if !status.is_success() {
            anyhow::bail!("exchange GET /api/v3/klines returned {status}: {body}");
        }

        let raw = body.as_array().context("klines response is not an array")?;
        let now_ms = Utc::now().timestamp_millis();

        let mut candles = Vec::with_capacity(raw.len());
        for entry in raw {
            let arr = entry.as_array().context("kline entry is not an array")?;
            if arr.len() < 8 {
                warn!(elements = arr.len(), "skipping malformed kline entry");
                continue;
            }

            let open_time = arr[0].as_i64().unwrap_or(0);
            let close_time = arr[6].as_i64().unwrap_or(0);
            candles.push(Candle {
                open_time,
                close_time,
                open: parse_str_f64(&arr[1])?,
                high: parse_str_f64(&arr[2])?,
                low: parse_str_f64(&arr[3])?,
                close: parse_str_f64(&arr[4])?,
                volume: parse_str_f64(&arr[5])?,
                quote_volume: parse_str_f64(&arr[7])?,
                is_closed: close_time <= now_ms,
            });
        }

        debug!(symbol, interval, count = candles.len(), "klines fetched");
        Ok(candles)
    }

    /// GET /api/v3/ticker/24hr for all symbols (public). Used by the
    /// top-volume tracker; polled at most once per second.
    pub async fn get_ticker_24hr(&self) -> Result<Vec<Ticker>> {
        self.limits.acquire(40).await;

        let url = format!("{}/api/v3/ticker/24hr", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/ticker/24hr request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse 24hr ticker response")?;

        if !status.is_success() {
            anyhow::bail!("exchange GET /api/v3/ticker/24hr returned {status}: {body}");
        }

        let raw = body.as_array().context("ticker response is not an array")?;
        let now_ms = Utc::now().timestamp_millis();

        let mut tickers = Vec::with_capacity(raw.len());
        for entry in raw {
            let symbol = match entry["symbol"].as_str() {
                Some(s) => s.to_string(),
                None => continue,
            };
            tickers.push(Ticker {
                symbol,
                last_price: parse_str_f64(&entry["lastPrice"]).unwrap_or(0.0),
                change_pct_24h: parse_str_f64(&entry["priceChangePercent"]).unwrap_or(0.0),
                quote_volume_24h: parse_str_f64(&entry["quoteVolume"]).unwrap_or(0.0),
                updated_at: entry["closeTime"].as_i64().unwrap_or(now_ms),
            });
        }

        debug!(count = tickers.len(), "24hr tickers fetched");
        Ok(tickers)
    }

    // -------------------------------------------------------------------------
    // Orders (signed)
    // -------------------------------------------------------------------------

    /// POST /api/v3/order -- submit a MARKET order.
    ///
    /// `client_order_id` is the caller's idempotency key: the exchange
    /// rejects a duplicate id instead of double-filling.
    pub async fn place_market_order(
        &self,
        symbol: &str,
        side: &str,
        quantity: f64,
        client_order_id: &str,
    ) -> Result<OrderAck> {
        self.limits.acquire(1).await;
        if !self.limits.try_order() {
            anyhow::bail!("order rate window exhausted");
        }

        let params = format!(
            "symbol={symbol}&side={side}&type=MARKET&quantity={quantity}\
             &newClientOrderId={client_order_id}"
        );
        let qs = self.signed_query(&params);
        let url = format!("{}/api/v3/order?{}", self.base_url, qs);

        debug!(symbol, side, quantity, "placing market order");

        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .context("POST /api/v3/order request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse order response")?;

        if !status.is_success() {
            anyhow::bail!("exchange POST /api/v3/order returned {status}: {body}");
        }

        Ok(parse_order_ack(&body)?)
    }

    /// GET /api/v3/account (signed).
    pub async fn get_account(&self) -> Result<serde_json::Value> {
        self.limits.acquire(10).await;

        let qs = self.signed_query("");
        let url = format!("{}/api/v3/account?{}", self.base_url, qs);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/account request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse account response")?;

        if !status.is_success() {
            anyhow::bail!("exchange GET /api/v3/account returned {status}: {body}");
        }
        Ok(body)
    }

    /// Whether credentials were supplied at construction.
    pub fn has_credentials(&self) -> bool {
        !self.api_key.is_empty() && !self.secret.is_empty()
    }
}

/// Extract the fields the engine cares about from an order acknowledgement.
fn parse_order_ack(body: &serde_json::Value) -> Result<OrderAck> {
    let order_id = body["orderId"].as_u64().context("order ack missing orderId")?;
    let executed_qty = parse_str_f64(&body["executedQty"]).unwrap_or(0.0);
    let cumm_quote = parse_str_f64(&body["cummulativeQuoteQty"]).unwrap_or(0.0);
    let fill_price = if executed_qty > 0.0 {
        cumm_quote / executed_qty
    } else {
        parse_str_f64(&body["price"]).unwrap_or(0.0)
    };
    let status = body["status"].as_str().unwrap_or("UNKNOWN").to_string();

    Ok(OrderAck {
        order_id,
        executed_qty,
        fill_price,
        status,
    })
}

/// Parse a JSON value that may be either a string or a number into `f64`.
fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .with_context(|| format!("failed to parse '{s}' as f64"))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        anyhow::bail!("expected string or number, got: {val}")
    }
}

impl std::fmt::Debug for ExchangeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}
