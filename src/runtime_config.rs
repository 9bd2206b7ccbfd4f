// =============================================================================
// Runtime Configuration — sync settings with env overrides and atomic save
// =============================================================================
//
// Every tunable of the sync layer lives here: backend endpoints, the pairs to
// watch, buffer size and the reconnect policy. The JSON file is the base
// layer; `FXDASH_*` environment variables (optionally from `.env`) override
// it at startup.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry serde defaults so that adding new fields never
// breaks loading an older config file.
//
// Secrets (API token, login credentials, dashboard token) are read from the
// environment only and never written to the file.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::market_data::connector::BackoffPolicy;
use crate::types::StreamKey;

pub const ENV_API_URL: &str = "FXDASH_API_URL";
pub const ENV_WS_URL: &str = "FXDASH_WS_URL";
pub const ENV_STREAMS: &str = "FXDASH_STREAMS";
pub const ENV_BIND_ADDR: &str = "FXDASH_BIND_ADDR";

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_api_url() -> String {
    "http://localhost:8000/api".to_string()
}

fn default_streams() -> Vec<String> {
    vec!["EURUSD@1h".to_string()]
}

fn default_bind_addr() -> String {
    "127.0.0.1:3001".to_string()
}

fn default_candle_limit() -> usize {
    500
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_base_delay_ms() -> u64 {
    1000
}

fn default_max_reconnect_delay_ms() -> u64 {
    30_000
}

fn default_fetch_timeout_ms() -> u64 {
    10_000
}

fn default_outbound_queue_limit() -> usize {
    256
}

// =============================================================================
// RuntimeConfig
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Endpoints -----------------------------------------------------------

    /// Backend REST root, e.g. `https://api.example.com/api`.
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Streaming root. Derived from `api_url` (http → ws) when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_url: Option<String>,

    /// Address the dashboard feed listens on.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    // --- Watched pairs -------------------------------------------------------

    /// Pairs synchronized at startup, as `SYMBOL@timeframe`.
    #[serde(default = "default_streams")]
    pub streams: Vec<String>,

    /// Most recent candles kept per pair.
    #[serde(default = "default_candle_limit")]
    pub candle_limit: usize,

    // --- Stream reconnect policy --------------------------------------------

    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// First reconnect delay; doubles on every further attempt.
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    #[serde(default = "default_max_reconnect_delay_ms")]
    pub max_reconnect_delay_ms: u64,

    /// Messages held while the socket is down; oldest dropped first.
    #[serde(default = "default_outbound_queue_limit")]
    pub outbound_queue_limit: usize,

    // --- HTTP ----------------------------------------------------------------

    /// Client-side deadline per backend request.
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            ws_url: None,
            bind_addr: default_bind_addr(),
            streams: default_streams(),
            candle_limit: default_candle_limit(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            max_reconnect_delay_ms: default_max_reconnect_delay_ms(),
            outbound_queue_limit: default_outbound_queue_limit(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            streams = ?config.streams,
            api_url = %config.api_url,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Environment overrides
    // -------------------------------------------------------------------------

    /// Apply `FXDASH_*` variables from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary lookup. Blank values are ignored.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(url) = get(ENV_API_URL) {
            info!(api_url = %url, "api_url overridden from environment");
            self.api_url = url;
        }
        if let Some(url) = get(ENV_WS_URL) {
            info!(ws_url = %url, "ws_url overridden from environment");
            self.ws_url = Some(url);
        }
        if let Some(addr) = get(ENV_BIND_ADDR) {
            self.bind_addr = addr;
        }
        if let Some(list) = get(ENV_STREAMS) {
            self.streams = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            info!(streams = ?self.streams, "streams overridden from environment");
        }
    }

    // -------------------------------------------------------------------------
    // Derived settings
    // -------------------------------------------------------------------------

    /// Streaming root: `ws_url` when set, else `api_url` with its scheme
    /// switched to ws / wss.
    pub fn stream_base(&self) -> String {
        if let Some(url) = &self.ws_url {
            return url.trim_end_matches('/').to_string();
        }
        let api = self.api_url.trim_end_matches('/');
        if let Some(rest) = api.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = api.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            api.to_string()
        }
    }

    /// Parsed `streams`. Invalid entries are skipped with a warning.
    pub fn stream_keys(&self) -> Vec<StreamKey> {
        let mut keys: Vec<StreamKey> = Vec::with_capacity(self.streams.len());
        for raw in &self.streams {
            match raw.parse::<StreamKey>() {
                Ok(key) if !keys.contains(&key) => keys.push(key),
                Ok(_) => {}
                Err(e) => warn!(entry = %raw, error = %e, "ignoring invalid stream entry"),
            }
        }
        keys
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(self.max_reconnect_delay_ms.max(self.reconnect_base_delay_ms)),
            max_attempts: self.max_reconnect_attempts,
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}
