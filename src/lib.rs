//! Real-time market-data synchronization for the forex dashboard.
//!
//! For each watched (symbol, timeframe) pair a [`market_data::MarketSync`]
//! loads candle history over REST, follows the live candle stream over a
//! WebSocket with backoff reconnect, merges updates into a bounded buffer and
//! publishes snapshots. [`app_state::AppState`] keeps the set of syncs and
//! [`api`] serves them to the dashboard.

pub mod api;
pub mod app_state;
pub mod backend;
pub mod error;
pub mod market_data;
pub mod runtime_config;
pub mod types;

pub use error::{SyncError, SyncResult};
pub use market_data::{Candle, CandleBuffer, MarketSync, SyncSettings, SyncSnapshot};
pub use types::{ConnectionState, StreamKey, Timeframe};
