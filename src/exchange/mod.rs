// Exchange REST access: signed client plus the process-wide rate limiter.

pub mod client;
pub mod rate_limit;

pub use client::{ExchangeClient, OrderAck};
pub use rate_limit::RateLimiter;
