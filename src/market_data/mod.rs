pub mod candle_buffer;
pub mod connector;
pub mod fetcher;
pub mod stream;
pub mod sync;

// Re-exports for convenient access (e.g. `use crate::market_data::MarketSync`).
pub use candle_buffer::{Candle, CandleBuffer, MergeOutcome};
pub use connector::{BackoffPolicy, CloseCause, StreamConnector};
pub use fetcher::CandleFetcher;
pub use sync::{MarketSync, SyncSettings, SyncSnapshot, SyncSummary};
