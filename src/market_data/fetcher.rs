// =============================================================================
// Candle Fetcher — historical candles over REST
// =============================================================================

use tracing::{debug, instrument, warn};

use crate::backend::ApiClient;
use crate::error::{SyncError, SyncResult};
use crate::market_data::candle_buffer::{Candle, CandleBuffer};
use crate::types::StreamKey;

const CANDLES_PATH: &str = "/market/candles";

#[derive(Debug, Clone)]
pub struct CandleFetcher {
    api: ApiClient,
}

impl CandleFetcher {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    /// GET /market/candles?symbol=&timeframe=&limit=
    ///
    /// Returns up to `limit` most recent candles, ascending, one per bucket.
    #[instrument(skip(self), fields(key = %key), name = "fetcher::fetch")]
    pub async fn fetch(&self, key: &StreamKey, limit: usize) -> SyncResult<CandleBuffer> {
        let body: serde_json::Value = self
            .api
            .get_json(
                CANDLES_PATH,
                &[
                    ("symbol", key.symbol.clone()),
                    ("timeframe", key.timeframe.to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;

        let candles = parse_history(&body)?;
        let buffer = CandleBuffer::from_history(candles, key.timeframe, limit);
        debug!(count = buffer.len(), "candles fetched");
        Ok(buffer)
    }
}

/// Accepts a bare array or an array wrapped under `data` / `candles`.
/// Malformed entries are skipped.
fn parse_history(body: &serde_json::Value) -> SyncResult<Vec<Candle>> {
    let raw = body
        .as_array()
        .or_else(|| body.get("data").and_then(|v| v.as_array()))
        .or_else(|| body.get("candles").and_then(|v| v.as_array()))
        .ok_or_else(|| SyncError::parse("candles response is not an array"))?;

    let mut candles = Vec::with_capacity(raw.len());
    for entry in raw {
        match Candle::from_wire(entry) {
            Ok(c) => candles.push(c),
            Err(e) => warn!(error = %e, "skipping malformed candle entry"),
        }
    }
    Ok(candles)
}

// ---------------------------------------------------------------------------
// FetchGate — one outstanding fetch per parameter set
// ---------------------------------------------------------------------------

/// Tracks the in-flight fetch so repeated refreshes do not stack up and a
/// response for a superseded parameter set is recognised as stale.
#[derive(Debug, Default)]
pub struct FetchGate {
    generation: u64,
    in_flight: Option<(u64, StreamKey)>,
}

impl FetchGate {
    /// Start a fetch for `key`. Returns its generation, or `None` when a fetch
    /// for the same key is already running.
    pub fn begin(&mut self, key: &StreamKey) -> Option<u64> {
        if matches!(&self.in_flight, Some((_, k)) if k == key) {
            return None;
        }
        self.generation += 1;
        self.in_flight = Some((self.generation, key.clone()));
        Some(self.generation)
    }

    /// A fetch finished. Returns `true` when its result is current.
    pub fn complete(&mut self, generation: u64) -> bool {
        match &self.in_flight {
            Some((g, _)) if *g == generation => {
                self.in_flight = None;
                true
            }
            _ => false,
        }
    }

    /// Forget the in-flight fetch; any later completion is stale.
    pub fn cancel(&mut self) {
        self.in_flight = None;
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }
}
