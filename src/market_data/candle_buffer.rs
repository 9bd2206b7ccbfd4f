use std::collections::VecDeque;

use serde::{Deserialize, Serialize, Serializer};

use crate::error::{SyncError, SyncResult};
use crate::types::Timeframe;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// One OHLC candle. `time` is unix seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
}

impl Candle {
    pub fn new(time: i64, open: f64, high: f64, low: f64, close: f64) -> Self {
        Self {
            time,
            open,
            high,
            low,
            close,
            volume: None,
        }
    }

    pub fn with_volume(mut self, volume: f64) -> Self {
        self.volume = Some(volume);
        self
    }

    /// Parse the backend's wire shape:
    ///
    /// ```json
    /// { "timestamp": 1700000000000, "open": "1.0712", "high": 1.0720,
    ///   "low": "1.0705", "close": "1.0716", "volume": "1520" }
    /// ```
    ///
    /// `timestamp` is milliseconds (number or numeric string) or an RFC 3339
    /// string. Payloads already in our own shape carry `time` in unix seconds
    /// instead. Price fields may be numbers or numeric strings.
    pub fn from_wire(val: &serde_json::Value) -> SyncResult<Self> {
        let time = match (val.get("timestamp"), val.get("time")) {
            (Some(ts), _) => parse_timestamp_secs(ts)?,
            (None, Some(secs)) => parse_unix_secs(secs)?,
            (None, None) => return Err(SyncError::parse("missing field timestamp")),
        };
        let open = parse_number(&val["open"], "open")?;
        let high = parse_number(&val["high"], "high")?;
        let low = parse_number(&val["low"], "low")?;
        let close = parse_number(&val["close"], "close")?;
        let volume = match val.get("volume") {
            None | Some(serde_json::Value::Null) => None,
            Some(v) => Some(parse_number(v, "volume")?),
        };

        Ok(Self {
            time,
            open,
            high,
            low,
            close,
            volume,
        })
    }
}

/// The backend sends prices either as JSON numbers or as numeric strings.
pub(crate) fn parse_number(val: &serde_json::Value, name: &str) -> SyncResult<f64> {
    let n = match val {
        serde_json::Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|e| SyncError::parse(format!("failed to parse {name} as f64: {s} ({e})")))?,
        serde_json::Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| SyncError::parse(format!("field {name} is not a valid f64")))?,
        serde_json::Value::Null => return Err(SyncError::parse(format!("missing field {name}"))),
        _ => return Err(SyncError::parse(format!("field {name} has unexpected JSON type"))),
    };
    if !n.is_finite() {
        return Err(SyncError::parse(format!("field {name} is not finite")));
    }
    Ok(n)
}

/// Millisecond timestamp (number / numeric string) or RFC 3339 string to unix
/// seconds.
pub(crate) fn parse_timestamp_secs(val: &serde_json::Value) -> SyncResult<i64> {
    if let serde_json::Value::String(s) = val {
        if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s.trim()) {
            return Ok(dt.timestamp());
        }
    }
    let ms = parse_number(val, "timestamp")?;
    Ok((ms / 1000.0).floor() as i64)
}

/// Unix seconds (number / numeric string) or RFC 3339 string.
fn parse_unix_secs(val: &serde_json::Value) -> SyncResult<i64> {
    if let serde_json::Value::String(s) = val {
        if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s.trim()) {
            return Ok(dt.timestamp());
        }
    }
    Ok(parse_number(val, "time")?.floor() as i64)
}

// ---------------------------------------------------------------------------
// CandleBuffer
// ---------------------------------------------------------------------------

/// What a merge did to the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The update landed in an existing bucket.
    Updated,
    /// A new bucket was appended; `evicted` candles fell off the front.
    Appended { evicted: usize },
    /// Older than every bucket still held; dropped.
    Stale,
}

/// Bounded, ascending-by-time candle window for one (symbol, timeframe).
///
/// Invariants: sorted ascending by bucket, at most one candle per bucket,
/// `len() <= limit()`.
#[derive(Debug, Clone, PartialEq)]
pub struct CandleBuffer {
    candles: VecDeque<Candle>,
    timeframe: Timeframe,
    limit: usize,
}

impl CandleBuffer {
    pub fn new(timeframe: Timeframe, limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            candles: VecDeque::with_capacity(limit + 1),
            timeframe,
            limit,
        }
    }

    /// Build a buffer from a history response: sort ascending, collapse
    /// duplicate buckets (later entry wins), keep the most recent `limit`.
    pub fn from_history(mut candles: Vec<Candle>, timeframe: Timeframe, limit: usize) -> Self {
        let mut buf = Self::new(timeframe, limit);
        candles.sort_by_key(|c| c.time);

        for candle in candles {
            let bucket = timeframe.bucket_start(candle.time);
            match buf.candles.back_mut() {
                Some(last) if timeframe.bucket_start(last.time) == bucket => *last = candle,
                _ => buf.candles.push_back(candle),
            }
        }
        buf.trim();
        buf
    }

    /// Pure merge: returns the buffer that results from applying `update`.
    pub fn merge(&self, update: &Candle) -> (Self, MergeOutcome) {
        let mut next = self.clone();
        let outcome = next.apply(update);
        (next, outcome)
    }

    fn apply(&mut self, update: &Candle) -> MergeOutcome {
        let tf = self.timeframe;
        let bucket = tf.bucket_start(update.time);

        let last_bucket = match self.candles.back() {
            Some(last) => tf.bucket_start(last.time),
            None => {
                self.candles.push_back(update.clone());
                return MergeOutcome::Appended { evicted: 0 };
            }
        };

        if bucket > last_bucket {
            self.candles.push_back(update.clone());
            let evicted = self.trim();
            return MergeOutcome::Appended { evicted };
        }

        let slot = if bucket == last_bucket {
            Some(self.candles.len() - 1)
        } else {
            self.candles
                .binary_search_by_key(&bucket, |c| tf.bucket_start(c.time))
                .ok()
        };

        match slot.and_then(|i| self.candles.get_mut(i)) {
            Some(existing) => {
                existing.high = existing.high.max(update.high);
                existing.low = existing.low.min(update.low);
                existing.close = update.close;
                if update.volume.is_some() {
                    existing.volume = update.volume;
                }
                MergeOutcome::Updated
            }
            None => MergeOutcome::Stale,
        }
    }

    /// Evict from the front until `len() <= limit`. Returns evicted count.
    fn trim(&mut self) -> usize {
        let mut evicted = 0;
        while self.candles.len() > self.limit {
            self.candles.pop_front();
            evicted += 1;
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Candle> {
        self.candles.iter()
    }

    pub fn to_vec(&self) -> Vec<Candle> {
        self.candles.iter().cloned().collect()
    }

    /// Most recent close, if any.
    pub fn last_close(&self) -> Option<f64> {
        self.candles.back().map(|c| c.close)
    }
}

impl Serialize for CandleBuffer {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.candles.iter())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
