// =============================================================================
// Central Application State — registry of running market syncs
// =============================================================================
//
// One `MarketSync` per watched (symbol, timeframe) pair, plus the shared
// backend client and runtime config. AppState ties them together and
// provides a unified snapshot for the dashboard API and WebSocket feed.
//
// Thread safety:
//   - Atomic counters for lock-free version tracking.
//   - parking_lot::RwLock for the sync map and the runtime config.
//   - Each MarketSync publishes through its own watch channel; reading a
//     snapshot never blocks its driver.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::info;

use crate::backend::ApiClient;
use crate::market_data::{MarketSync, SyncSettings, SyncSnapshot, SyncSummary};
use crate::runtime_config::RuntimeConfig;
use crate::types::StreamKey;

/// Shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    // ── Version tracking ────────────────────────────────────────────────
    /// Bumped whenever the set of watched pairs changes. Combined with the
    /// per-sync revisions in [`AppState::current_state_version`].
    pub registry_version: AtomicU64,

    /// WebSocket message sequence number (incremented per message sent).
    pub ws_sequence_number: AtomicU64,

    // ── Configuration ───────────────────────────────────────────────────
    pub runtime_config: Arc<RwLock<RuntimeConfig>>,

    // ── Backend ─────────────────────────────────────────────────────────
    api: ApiClient,

    /// Bearer token guarding the control routes. `None` rejects them all.
    dashboard_token: Option<String>,

    // ── Syncs ───────────────────────────────────────────────────────────
    syncs: RwLock<HashMap<StreamKey, Arc<MarketSync>>>,

    // ── Timing ──────────────────────────────────────────────────────────
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(config: RuntimeConfig, api: ApiClient) -> Self {
        Self {
            registry_version: AtomicU64::new(1),
            ws_sequence_number: AtomicU64::new(0),
            runtime_config: Arc::new(RwLock::new(config)),
            api,
            dashboard_token: None,
            syncs: RwLock::new(HashMap::new()),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn with_dashboard_token(mut self, token: Option<String>) -> Self {
        self.dashboard_token = token.filter(|t| !t.is_empty());
        self
    }

    pub fn api_client(&self) -> &ApiClient {
        &self.api
    }

    pub fn dashboard_token(&self) -> Option<&str> {
        self.dashboard_token.as_deref()
    }

    // ── Registry ────────────────────────────────────────────────────────

    /// Start syncing `key` unless it is already watched. Returns the sync and
    /// whether it was newly started. Must be called from within a tokio
    /// runtime.
    pub fn watch(&self, key: StreamKey) -> (Arc<MarketSync>, bool) {
        let mut syncs = self.syncs.write();
        if let Some(existing) = syncs.get(&key) {
            return (Arc::clone(existing), false);
        }

        let settings = {
            let mut config = self.runtime_config.write();
            let entry = key.to_string();
            if !config.streams.iter().any(|s| s.eq_ignore_ascii_case(&entry)) {
                config.streams.push(entry);
            }
            SyncSettings::from_config(&config)
        };

        let sync = Arc::new(MarketSync::start(key.clone(), settings, self.api.clone()));
        syncs.insert(key.clone(), Arc::clone(&sync));
        self.registry_version.fetch_add(1, Ordering::SeqCst);
        info!(key = %key, watched = syncs.len(), "pair watched");
        (sync, true)
    }

    /// Stop syncing `key` and forget it. Returns `false` when it was not
    /// watched.
    pub async fn unwatch(&self, key: &StreamKey) -> bool {
        let removed = self.syncs.write().remove(key);
        let Some(sync) = removed else {
            return false;
        };

        {
            let entry = key.to_string();
            self.runtime_config
                .write()
                .streams
                .retain(|s| !s.eq_ignore_ascii_case(&entry));
        }

        sync.stop().await;
        // Fold the retired sync's revisions into the registry counter so the
        // combined version keeps increasing.
        let last_revision = sync.snapshot().revision;
        self.registry_version.fetch_add(last_revision + 1, Ordering::SeqCst);
        info!(key = %key, "pair unwatched");
        true
    }

    pub fn get(&self, key: &StreamKey) -> Option<Arc<MarketSync>> {
        self.syncs.read().get(key).cloned()
    }

    /// Watched pairs in display order.
    pub fn watched(&self) -> Vec<StreamKey> {
        let mut keys: Vec<StreamKey> = self.syncs.read().keys().cloned().collect();
        keys.sort_by_key(|k| (k.symbol.clone(), k.timeframe.as_secs()));
        keys
    }

    pub fn summaries(&self) -> Vec<SyncSummary> {
        self.sorted_snapshots().iter().map(SyncSnapshot::summary).collect()
    }

    /// Stop every sync.
    pub async fn shutdown(&self) {
        let drained: Vec<Arc<MarketSync>> = self.syncs.write().drain().map(|(_, s)| s).collect();
        for sync in &drained {
            sync.stop().await;
        }
        self.registry_version.fetch_add(1, Ordering::SeqCst);
        info!(stopped = drained.len(), "all market syncs stopped");
    }

    // ── Version Management ──────────────────────────────────────────────

    /// Changes whenever any sync publishes or the watched set changes.
    pub fn current_state_version(&self) -> u64 {
        let revisions: u64 = self
            .syncs
            .read()
            .values()
            .map(|s| s.snapshot().revision)
            .sum();
        self.registry_version.load(Ordering::SeqCst) + revisions
    }

    // ── Snapshot Builder ────────────────────────────────────────────────

    /// Complete, serialisable view of every watched pair. This is the payload
    /// of the WebSocket push feed.
    pub fn build_snapshot(&self) -> DashboardSnapshot {
        let now = Utc::now();
        // Sync map before config: `watch` takes them in that order.
        let state_version = self.current_state_version();
        let streams = self.sorted_snapshots();
        let config = self.runtime_config.read();

        DashboardSnapshot {
            state_version,
            ws_sequence_number: self.ws_sequence_number.load(Ordering::Relaxed),
            server_time: now.timestamp_millis(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            config: ConfigSummary {
                api_url: config.api_url.clone(),
                stream_base: config.stream_base(),
                candle_limit: config.candle_limit,
                max_reconnect_attempts: config.max_reconnect_attempts,
            },
            streams,
        }
    }

    fn sorted_snapshots(&self) -> Vec<SyncSnapshot> {
        let mut snaps: Vec<SyncSnapshot> = self.syncs.read().values().map(|s| s.snapshot()).collect();
        snaps.sort_by_key(|s| (s.key.symbol.clone(), s.key.timeframe.as_secs()));
        snaps
    }
}

// =============================================================================
// Serialisable snapshot types
// =============================================================================

/// Everything the dashboard needs in one message.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardSnapshot {
    pub state_version: u64,
    pub ws_sequence_number: u64,
    pub server_time: i64,
    pub uptime_secs: u64,
    pub config: ConfigSummary,
    pub streams: Vec<SyncSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigSummary {
    pub api_url: String,
    pub stream_base: String,
    pub candle_limit: usize,
    pub max_reconnect_attempts: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{LocalStore, StoredCredentials};
    use crate::types::Timeframe;
    use std::time::Duration;

    /// Backend and stream both point at a closed port, with no retries.
    fn offline_state() -> AppState {
        let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = closed.local_addr().unwrap();
        drop(closed);

        let config = RuntimeConfig {
            api_url: format!("http://{addr}"),
            streams: Vec::new(),
            max_reconnect_attempts: 0,
            ..RuntimeConfig::default()
        };
        let creds = Arc::new(StoredCredentials::new(Arc::new(LocalStore::new())));
        let api = ApiClient::new(&config.api_url, creds, Duration::from_secs(1)).unwrap();
        AppState::new(config, api)
    }

    #[tokio::test]
    async fn watch_is_idempotent_and_tracked_in_config() {
        let state = offline_state();
        let key = StreamKey::new("EURUSD", Timeframe::H1);

        let (first, created) = state.watch(key.clone());
        assert!(created);
        let (second, created) = state.watch(key.clone());
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));

        assert_eq!(state.watched(), vec![key.clone()]);
        assert_eq!(state.runtime_config.read().streams, vec!["EURUSD@1h"]);
        assert!(state.get(&key).is_some());

        state.shutdown().await;
        assert!(state.watched().is_empty());
    }

    #[tokio::test]
    async fn unwatch_removes_and_version_keeps_increasing() {
        let state = offline_state();
        let key = StreamKey::new("GBPUSD", Timeframe::M15);
        let v0 = state.current_state_version();

        let (sync, _) = state.watch(key.clone());
        let mut rx = sync.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.error.is_some() && !s.fetching))
            .await
            .unwrap()
            .unwrap();
        let v1 = state.current_state_version();
        assert!(v1 > v0);

        assert!(state.unwatch(&key).await);
        assert!(!state.unwatch(&key).await);
        assert!(state.get(&key).is_none());
        assert!(state.runtime_config.read().streams.is_empty());
        assert!(state.current_state_version() > v1);
    }

    #[tokio::test]
    async fn snapshot_lists_pairs_in_order() {
        let state = offline_state();
        state.watch(StreamKey::new("USDJPY", Timeframe::M1));
        state.watch(StreamKey::new("EURUSD", Timeframe::D1));
        state.watch(StreamKey::new("EURUSD", Timeframe::M5));

        let snap = state.build_snapshot();
        let keys: Vec<String> = snap.streams.iter().map(|s| s.key.to_string()).collect();
        assert_eq!(keys, vec!["EURUSD@5m", "EURUSD@1d", "USDJPY@1m"]);
        assert_eq!(snap.config.candle_limit, 500);

        let summaries = state.summaries();
        assert_eq!(summaries.len(), 3);
        assert!(summaries.iter().all(|s| s.candle_count == 0));

        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["streams"].as_array().unwrap().len(), 3);

        state.shutdown().await;
    }
}
