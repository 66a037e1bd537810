// Market data: the hub owns the exchange streaming relationship; the store
// holds the authoritative snapshot everyone else reads.

pub mod hub;
pub mod store;
pub mod stream;
pub mod top_volume;

pub use hub::{CloseEvent, HubConfig, MarketDataHub};
pub use store::{MarketStore, TickerUpdate};
pub use top_volume::TopVolumeTracker;
