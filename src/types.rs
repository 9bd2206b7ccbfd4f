// =============================================================================
// Shared types used across the market data sync layer
// =============================================================================

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// 1970-01-05 00:00 UTC, the first Monday after the epoch.
const MONDAY_ANCHOR_SECS: i64 = 4 * 24 * 60 * 60;

/// Candle bucket width.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[default]
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "1w")]
    W1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 8] = [
        Self::M1,
        Self::M5,
        Self::M15,
        Self::M30,
        Self::H1,
        Self::H4,
        Self::D1,
        Self::W1,
    ];

    /// Bucket width in seconds.
    pub fn as_secs(self) -> i64 {
        match self {
            Self::M1 => 60,
            Self::M5 => 5 * 60,
            Self::M15 => 15 * 60,
            Self::M30 => 30 * 60,
            Self::H1 => 60 * 60,
            Self::H4 => 4 * 60 * 60,
            Self::D1 => 24 * 60 * 60,
            Self::W1 => 7 * 24 * 60 * 60,
        }
    }

    /// Start of the bucket containing `time` (unix seconds).
    ///
    /// Weekly buckets open Monday 00:00 UTC. Candles are expected to carry
    /// their bucket-open time, so a backend that opens weeks on Sunday evening
    /// still matches as long as updates repeat the stamp of the candle they
    /// belong to.
    pub fn bucket_start(self, time: i64) -> i64 {
        let anchor = match self {
            Self::W1 => MONDAY_ANCHOR_SECS,
            _ => 0,
        };
        let shifted = time - anchor;
        time - shifted.rem_euclid(self.as_secs())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
            Self::W1 => "1w",
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|tf| tf.as_str() == s)
            .ok_or_else(|| SyncError::parse(format!("unknown timeframe '{s}'")))
    }
}

/// Identifies one synchronization instance: a (symbol, timeframe) pair.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct StreamKey {
    pub symbol: String,
    pub timeframe: Timeframe,
}

impl StreamKey {
    pub fn new(symbol: impl AsRef<str>, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.as_ref().trim().to_uppercase(),
            timeframe,
        }
    }
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.timeframe)
    }
}

impl FromStr for StreamKey {
    type Err = SyncError;

    /// Parses `EURUSD@1h`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (symbol, timeframe) = s
            .trim()
            .split_once('@')
            .ok_or_else(|| SyncError::parse(format!("stream key '{s}' is not SYMBOL@timeframe")))?;
        if symbol.trim().is_empty() {
            return Err(SyncError::parse(format!("stream key '{s}' has an empty symbol")));
        }
        Ok(Self::new(symbol, timeframe.parse()?))
    }
}

/// Lifecycle of the streaming socket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    #[default]
    Closed,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == Self::Open
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "Connecting"),
            Self::Open => write!(f, "Open"),
            Self::Closing => write!(f, "Closing"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}
