// =============================================================================
// Engine configuration -- environment-driven with serde defaults
// =============================================================================
//
// Every field carries a default so that a partially populated environment or
// an older persisted config file never fails to load.
// =============================================================================

use serde::{Deserialize, Serialize};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_candle_history() -> usize {
    300
}

fn default_tick_channel_capacity() -> usize {
    1_024
}

fn default_global_eval_slots() -> usize {
    500
}

fn default_admission_ceiling_ms() -> u64 {
    1_000
}

fn default_error_threshold() -> u32 {
    5
}

fn default_deadline_ceiling_ms() -> u64 {
    30_000
}

fn default_cancel_grace_ms() -> u64 {
    100
}

fn default_registry_poll_secs() -> u64 {
    15
}

fn default_top_volume_poll_secs() -> u64 {
    60
}

fn default_top_n() -> usize {
    100
}

fn default_paper_balance() -> f64 {
    10_000.0
}

fn default_fee_pct() -> f64 {
    0.1
}

fn default_monitor_shards() -> usize {
    4
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_reconnect_cap_secs() -> u64 {
    60
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Tenant selector in single-tenant local mode; empty means "all tenants
    /// this process is responsible for".
    #[serde(default)]
    pub user_id: String,

    /// Selects the paper executor when true; the real executor otherwise.
    #[serde(default)]
    pub paper_trading: bool,

    /// Exchange credentials (real executor only).
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,

    /// Storage backend URL. `memory:` selects the in-memory store; anything
    /// else is treated as a SQLite path/URL.
    #[serde(default)]
    pub storage_url: String,

    /// Admin listener address.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Closed candles retained per (symbol, timeframe) series.
    #[serde(default = "default_candle_history")]
    pub candle_history: usize,

    /// Per-subscriber bounded channel capacity for tick fan-out.
    #[serde(default = "default_tick_channel_capacity")]
    pub tick_channel_capacity: usize,

    /// Global concurrent-evaluation cap across all tenants.
    #[serde(default = "default_global_eval_slots")]
    pub global_eval_slots: usize,

    /// Admission must succeed within this budget after a candle close or the
    /// evaluation is skipped for the tick.
    #[serde(default = "default_admission_ceiling_ms")]
    pub admission_ceiling_ms: u64,

    /// Consecutive evaluation errors before a strategy is errored out.
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,

    /// Global ceiling on strategy-overridable evaluation deadlines.
    #[serde(default = "default_deadline_ceiling_ms")]
    pub deadline_ceiling_ms: u64,

    /// Grace window after a deadline fires before an evaluation is treated as
    /// non-returning.
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,

    /// Storage reconcile interval for strategy create/update/disable events.
    #[serde(default = "default_registry_poll_secs")]
    pub registry_poll_secs: u64,

    /// 24h-ticker poll interval for the top-volume set (floor 1 second).
    #[serde(default = "default_top_volume_poll_secs")]
    pub top_volume_poll_secs: u64,

    /// Default top-N size when a tenant quota does not override it.
    #[serde(default = "default_top_n")]
    pub default_top_n: usize,

    /// Starting paper balance per tenant, in quote units.
    #[serde(default = "default_paper_balance")]
    pub paper_starting_balance: f64,

    /// Fee charged per side, as a percentage of notional.
    #[serde(default = "default_fee_pct")]
    pub fee_pct: f64,

    /// Number of symbol-hash shards in the position monitor.
    #[serde(default = "default_monitor_shards")]
    pub monitor_shards: usize,

    /// Shutdown grace window.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// Reconnect backoff ceiling for the market-data connection.
    #[serde(default = "default_reconnect_cap_secs")]
    pub reconnect_cap_secs: u64,

    /// Explicit symbol universe override; empty means "derive from active
    /// strategies plus the top-volume set".
    #[serde(default)]
    pub symbols: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        // Round-trip through serde so the field defaults stay authoritative.
        serde_json::from_str("{}").expect("empty config object deserialises")
    }
}

impl EngineConfig {
    /// Build a config from the process environment. Unset variables fall back
    /// to the serde defaults above.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("USER_ID") {
            cfg.user_id = v;
        }
        cfg.paper_trading = std::env::var("PAPER_TRADING")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false);
        if let Ok(v) = std::env::var("BINANCE_API_KEY") {
            cfg.api_key = v;
        }
        if let Ok(v) = std::env::var("BINANCE_API_SECRET") {
            cfg.api_secret = v;
        }
        if let Ok(v) = std::env::var("STORAGE_URL") {
            cfg.storage_url = v;
        }
        if let Ok(v) = std::env::var("MERIDIAN_BIND_ADDR") {
            cfg.bind_addr = v;
        }
        if let Ok(v) = std::env::var("MERIDIAN_SYMBOLS") {
            cfg.symbols = v
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
        }

        cfg
    }

    /// Effective top-volume poll interval, clamped to the 1 Hz ceiling.
    pub fn top_volume_poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.top_volume_poll_secs.max(1))
    }

    /// Clamp a strategy-requested deadline to the global ceiling.
    pub fn clamp_deadline_ms(&self, requested: u64) -> u64 {
        requested.min(self.deadline_ceiling_ms).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.candle_history, 300);
        assert_eq!(cfg.global_eval_slots, 500);
        assert_eq!(cfg.error_threshold, 5);
        assert_eq!(cfg.default_top_n, 100);
        assert!((cfg.paper_starting_balance - 10_000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn deadline_clamped_to_ceiling() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.clamp_deadline_ms(5_000), 5_000);
        assert_eq!(cfg.clamp_deadline_ms(120_000), 30_000);
        assert_eq!(cfg.clamp_deadline_ms(0), 1);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: EngineConfig =
            serde_json::from_str(r#"{"paper_trading": true, "global_eval_slots": 32}"#).unwrap();
        assert!(cfg.paper_trading);
        assert_eq!(cfg.global_eval_slots, 32);
        assert_eq!(cfg.candle_history, 300);
    }
}
