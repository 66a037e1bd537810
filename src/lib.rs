// =============================================================================
// Meridian -- multi-tenant trading-signal screener engine
// =============================================================================
//
// Evaluates user-authored strategy scripts against live exchange market data
// on candle-close boundaries, persists deduplicated signals, and tracks open
// positions until stop-loss/take-profit exits fire.
// =============================================================================

pub mod api;
pub mod bus;
pub mod config;
pub mod errors;
pub mod exchange;
pub mod executor;
pub mod indicators;
pub mod lifecycle;
pub mod market_data;
pub mod monitor;
pub mod publisher;
pub mod registry;
pub mod sandbox;
pub mod scheduler;
pub mod storage;
pub mod types;
