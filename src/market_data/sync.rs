// =============================================================================
// Market Sync — one (symbol, timeframe) pair kept in step with the backend
// =============================================================================
//
// `MarketSync` is the handle; a single driver task does the work. The driver
// owns the candle buffer and the connector state machine and handles, one at
// a time:
//
//   • commands from the handle (refetch, reconnect, disconnect, send, ...)
//   • completed history fetches, tagged with their fetch generation
//   • session events (opened / text / closed), tagged with their session id
//   • the reconnect timer
//
// After every change it publishes a fresh `SyncSnapshot` on a watch channel.
// Consumers get `Arc<CandleBuffer>` views; only the merge path and a
// completed fetch ever replace the buffer.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::backend::{ApiClient, CredentialProvider};
use crate::error::{SyncError, SyncResult};
use crate::market_data::candle_buffer::{CandleBuffer, MergeOutcome};
use crate::market_data::connector::{BackoffPolicy, CloseCause, Outbound, ReconnectDecision, StreamConnector};
use crate::market_data::fetcher::{CandleFetcher, FetchGate};
use crate::market_data::stream::{parse_stream_message, run_session, stream_url, SessionEnvelope, SessionEvent};
use crate::runtime_config::RuntimeConfig;
use crate::types::{ConnectionState, StreamKey};

/// How long `stop()` waits for the socket to finish its close handshake.
const SESSION_CLOSE_GRACE: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct SyncSettings {
    /// Streaming root; see [`stream_url`].
    pub stream_base: String,
    pub candle_limit: usize,
    pub backoff: BackoffPolicy,
    pub outbound_queue_limit: usize,
}

impl SyncSettings {
    pub fn from_config(cfg: &RuntimeConfig) -> Self {
        Self {
            stream_base: cfg.stream_base(),
            candle_limit: cfg.candle_limit.max(1),
            backoff: cfg.backoff_policy(),
            outbound_queue_limit: cfg.outbound_queue_limit,
        }
    }
}

// ---------------------------------------------------------------------------
// Published state
// ---------------------------------------------------------------------------

/// Everything a consumer can observe about one sync.
#[derive(Debug, Clone, Serialize)]
pub struct SyncSnapshot {
    pub key: StreamKey,
    pub candles: Arc<CandleBuffer>,
    pub connection: ConnectionState,
    pub is_connected: bool,
    pub reconnect_attempts: u32,
    pub reconnect_scheduled: bool,
    pub fetching: bool,
    pub last_update: Option<DateTime<Utc>>,
    pub error: Option<SyncError>,
    /// Bumped on every publish.
    pub revision: u64,
}

impl SyncSnapshot {
    fn initial(key: StreamKey, limit: usize) -> Self {
        Self {
            candles: Arc::new(CandleBuffer::new(key.timeframe, limit)),
            key,
            connection: ConnectionState::Closed,
            is_connected: false,
            reconnect_attempts: 0,
            reconnect_scheduled: false,
            fetching: false,
            last_update: None,
            error: None,
            revision: 0,
        }
    }

    /// The snapshot without its candles.
    pub fn summary(&self) -> SyncSummary {
        SyncSummary {
            key: self.key.clone(),
            connection: self.connection,
            is_connected: self.is_connected,
            reconnect_attempts: self.reconnect_attempts,
            reconnect_scheduled: self.reconnect_scheduled,
            fetching: self.fetching,
            candle_count: self.candles.len(),
            last_close: self.candles.last_close(),
            last_update: self.last_update,
            error: self.error.clone(),
            revision: self.revision,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncSummary {
    pub key: StreamKey,
    pub connection: ConnectionState,
    pub is_connected: bool,
    pub reconnect_attempts: u32,
    pub reconnect_scheduled: bool,
    pub fetching: bool,
    pub candle_count: usize,
    pub last_close: Option<f64>,
    pub last_update: Option<DateTime<Utc>>,
    pub error: Option<SyncError>,
    pub revision: u64,
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Command {
    Refetch,
    Reconnect,
    Disconnect,
    Send(String),
    Retarget(StreamKey),
    Stop,
}

/// Handle to a running sync. Dropping it stops the driver.
pub struct MarketSync {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SyncSnapshot>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MarketSync {
    /// Spawn the driver: fetch history and open the stream right away.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(key: StreamKey, settings: SyncSettings, api: ApiClient) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (fetch_tx, fetch_rx) = mpsc::unbounded_channel();
        let (publisher, state) = watch::channel(SyncSnapshot::initial(key.clone(), settings.candle_limit));

        let driver = Driver {
            buffer: Arc::new(CandleBuffer::new(key.timeframe, settings.candle_limit)),
            connector: StreamConnector::new(settings.backoff, settings.outbound_queue_limit),
            credentials: Arc::clone(api.credentials()),
            fetcher: CandleFetcher::new(api),
            gate: FetchGate::default(),
            key,
            settings,
            last_update: None,
            error: None,
            session_id: 0,
            outbound: None,
            session_task: None,
            fetch_task: None,
            reconnect_at: None,
            events_tx: event_tx,
            fetch_tx,
            publisher,
            revision: 0,
        };

        let task = tokio::spawn(driver.run(cmd_rx, event_rx, fetch_rx));

        Self {
            commands: cmd_tx,
            state,
            task: Mutex::new(Some(task)),
        }
    }

    // -------------------------------------------------------------------------
    // Read side
    // -------------------------------------------------------------------------

    pub fn key(&self) -> StreamKey {
        self.state.borrow().key.clone()
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        self.state.borrow().clone()
    }

    pub fn candles(&self) -> Arc<CandleBuffer> {
        Arc::clone(&self.state.borrow().candles)
    }

    pub fn is_connected(&self) -> bool {
        self.state.borrow().is_connected
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.state.borrow().last_update
    }

    pub fn error(&self) -> Option<SyncError> {
        self.state.borrow().error.clone()
    }

    /// Receiver that always holds the latest snapshot.
    pub fn subscribe(&self) -> watch::Receiver<SyncSnapshot> {
        self.state.clone()
    }

    /// `false` once the driver has exited.
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    // -------------------------------------------------------------------------
    // Commands
    // -------------------------------------------------------------------------

    /// Fetch history again. No-op while a fetch for the same pair is running.
    pub fn refetch(&self) {
        self.command(Command::Refetch);
    }

    /// Reset the attempt counter and connect now, bypassing backoff.
    pub fn reconnect(&self) {
        self.command(Command::Reconnect);
    }

    /// Close the socket intentionally; no auto-reconnect follows.
    pub fn disconnect(&self) {
        self.command(Command::Disconnect);
    }

    /// Send a text frame, queueing it while the socket is down.
    pub fn send(&self, message: impl Into<String>) {
        self.command(Command::Send(message.into()));
    }

    /// Switch to another pair: cancels the running fetch, closes the socket
    /// intentionally and starts over with an empty buffer.
    pub fn retarget(&self, key: StreamKey) {
        self.command(Command::Retarget(key));
    }

    /// Tear down and wait for the driver to exit.
    pub async fn stop(&self) {
        self.command(Command::Stop);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "market sync task ended abnormally");
            }
        }
    }

    fn command(&self, cmd: Command) {
        if let Err(e) = self.commands.send(cmd) {
            debug!(command = ?e.0, "market sync already stopped");
        }
    }
}

impl std::fmt::Debug for MarketSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snap = self.state.borrow();
        f.debug_struct("MarketSync")
            .field("key", &snap.key)
            .field("connection", &snap.connection)
            .field("candles", &snap.candles.len())
            .field("revision", &snap.revision)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

struct FetchDone {
    generation: u64,
    result: SyncResult<CandleBuffer>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorOrigin {
    Fetch,
    Stream,
}

struct Driver {
    key: StreamKey,
    settings: SyncSettings,
    fetcher: CandleFetcher,
    credentials: Arc<dyn CredentialProvider>,
    connector: StreamConnector,
    gate: FetchGate,

    buffer: Arc<CandleBuffer>,
    last_update: Option<DateTime<Utc>>,
    error: Option<(ErrorOrigin, SyncError)>,

    session_id: u64,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    session_task: Option<JoinHandle<()>>,
    fetch_task: Option<JoinHandle<()>>,
    reconnect_at: Option<Instant>,

    events_tx: mpsc::UnboundedSender<SessionEnvelope>,
    fetch_tx: mpsc::UnboundedSender<FetchDone>,
    publisher: watch::Sender<SyncSnapshot>,
    revision: u64,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<SessionEnvelope>,
        mut fetches: mpsc::UnboundedReceiver<FetchDone>,
    ) {
        info!(key = %self.key, "market sync started");
        self.start_fetch();
        self.connector.begin_connect();
        self.open_session();
        self.publish();

        loop {
            let reconnect_at = self.reconnect_at;
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Stop) | None => break,
                    Some(cmd) => self.on_command(cmd),
                },
                Some(done) = fetches.recv() => self.on_fetch_done(done),
                Some(envelope) = events.recv() => self.on_session_event(envelope),
                _ = sleep_until(reconnect_at) => {
                    self.reconnect_at = None;
                    info!(key = %self.key, attempt = self.connector.attempts(), "reconnecting");
                    self.connector.begin_connect();
                    self.open_session();
                    self.publish();
                }
            }
        }

        self.shutdown().await;
    }

    // -------------------------------------------------------------------------
    // Commands
    // -------------------------------------------------------------------------

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Refetch => {
                self.start_fetch();
                self.publish();
            }
            Command::Reconnect => {
                info!(key = %self.key, "manual reconnect");
                self.reconnect_at = None;
                self.close_session();
                self.connector.manual_reconnect();
                self.open_session();
                self.publish();
            }
            Command::Disconnect => {
                info!(key = %self.key, "disconnect requested");
                self.reconnect_at = None;
                self.connector.disconnect();
                self.close_session();
                self.publish();
            }
            Command::Send(text) => match self.connector.queue(text) {
                Outbound::SendNow(text) => self.write(text),
                Outbound::Queued => {
                    debug!(key = %self.key, pending = self.connector.pending_len(), "message queued until connected");
                }
            },
            Command::Retarget(key) => self.retarget(key),
            // Handled by the run loop.
            Command::Stop => {}
        }
    }

    fn retarget(&mut self, key: StreamKey) {
        if key == self.key {
            debug!(key = %key, "retarget to current pair ignored");
            return;
        }
        info!(from = %self.key, to = %key, "retargeting market sync");

        self.cancel_fetch();
        self.reconnect_at = None;
        self.close_session();
        self.connector.reset();

        self.key = key;
        self.buffer = Arc::new(CandleBuffer::new(self.key.timeframe, self.settings.candle_limit));
        self.last_update = None;
        self.error = None;

        self.start_fetch();
        self.connector.begin_connect();
        self.open_session();
        self.publish();
    }

    // -------------------------------------------------------------------------
    // Fetcher
    // -------------------------------------------------------------------------

    fn start_fetch(&mut self) {
        let Some(generation) = self.gate.begin(&self.key) else {
            debug!(key = %self.key, "fetch already in flight");
            return;
        };

        let fetcher = self.fetcher.clone();
        let key = self.key.clone();
        let limit = self.settings.candle_limit;
        let done = self.fetch_tx.clone();
        self.fetch_task = Some(tokio::spawn(async move {
            let result = fetcher.fetch(&key, limit).await;
            let _ = done.send(FetchDone { generation, result });
        }));
    }

    fn cancel_fetch(&mut self) {
        if let Some(task) = self.fetch_task.take() {
            task.abort();
        }
        self.gate.cancel();
    }

    fn on_fetch_done(&mut self, done: FetchDone) {
        if !self.gate.complete(done.generation) {
            debug!(key = %self.key, generation = done.generation, "discarding superseded fetch result");
            return;
        }
        self.fetch_task = None;

        match done.result {
            Ok(buffer) => {
                info!(key = %self.key, candles = buffer.len(), "history loaded");
                self.buffer = Arc::new(buffer);
                self.last_update = Some(Utc::now());
                self.error = None;
            }
            Err(e) => {
                warn!(key = %self.key, error = %e, "history fetch failed, keeping previous candles");
                self.error = Some((ErrorOrigin::Fetch, e));
            }
        }
        self.publish();
    }

    // -------------------------------------------------------------------------
    // Stream
    // -------------------------------------------------------------------------

    fn open_session(&mut self) {
        self.session_id += 1;
        let token = self.credentials.token();
        let url = match stream_url(&self.settings.stream_base, &self.key, token.as_deref()) {
            Ok(url) => url,
            Err(e) => {
                warn!(key = %self.key, error = %e, "cannot build stream url");
                let failed = SessionEnvelope {
                    session: self.session_id,
                    event: SessionEvent::Closed(CloseCause::Failed(e)),
                };
                if self.events_tx.send(failed).is_err() {
                    debug!(key = %self.key, "driver event channel closed");
                }
                return;
            }
        };
        let (tx, rx) = mpsc::unbounded_channel();
        self.outbound = Some(tx);
        self.session_task = Some(tokio::spawn(run_session(
            self.session_id,
            self.key.clone(),
            url,
            rx,
            self.events_tx.clone(),
        )));
    }

    /// Dropping the outbound sender makes the session send the intentional
    /// close frame.
    fn close_session(&mut self) {
        self.outbound = None;
    }

    fn write(&self, text: String) {
        match &self.outbound {
            Some(tx) if tx.send(Message::Text(text)).is_ok() => {}
            _ => debug!(key = %self.key, "session gone, outbound message dropped"),
        }
    }

    fn on_session_event(&mut self, envelope: SessionEnvelope) {
        if envelope.session != self.session_id {
            debug!(key = %self.key, session = envelope.session, current = self.session_id, "ignoring event from retired session");
            return;
        }

        match envelope.event {
            SessionEvent::Opened => {
                if self.connector.state() != ConnectionState::Connecting {
                    debug!(key = %self.key, state = %self.connector.state(), "late open ignored");
                    return;
                }
                let queued = self.connector.on_open();
                if !queued.is_empty() {
                    debug!(key = %self.key, count = queued.len(), "flushing queued messages");
                }
                for text in queued {
                    self.write(text);
                }
                if matches!(self.error, Some((ErrorOrigin::Stream, _))) {
                    self.error = None;
                }
                self.publish();
            }
            SessionEvent::Text(text) => self.on_frame(&text),
            SessionEvent::Closed(cause) => self.on_session_closed(cause),
        }
    }

    fn on_frame(&mut self, text: &str) {
        let update = match parse_stream_message(text) {
            Ok(Some(update)) => update,
            Ok(None) => {
                debug!(key = %self.key, "ignoring non-candle message");
                return;
            }
            Err(e) => {
                warn!(key = %self.key, error = %e, "dropping malformed stream message");
                return;
            }
        };

        let (next, outcome) = self.buffer.merge(&update);
        if outcome == MergeOutcome::Stale {
            debug!(key = %self.key, time = update.time, "dropping stale update");
            return;
        }
        debug!(key = %self.key, ?outcome, time = update.time, close = update.close, "merged update");

        self.buffer = Arc::new(next);
        self.last_update = Some(Utc::now());
        if matches!(self.error, Some((ErrorOrigin::Stream, _))) {
            self.error = None;
        }
        self.publish();
    }

    fn on_session_closed(&mut self, cause: CloseCause) {
        self.outbound = None;
        self.session_task = None;

        match self.connector.on_closed(&cause) {
            ReconnectDecision::Retry { attempt, delay } => {
                self.error = Some((ErrorOrigin::Stream, close_error(&cause)));
                self.reconnect_at = Some(Instant::now() + delay);
                info!(key = %self.key, attempt, delay_ms = delay.as_millis() as u64, "stream down, reconnect scheduled");
            }
            ReconnectDecision::Exhausted => {
                let attempts = self.connector.attempts();
                error!(key = %self.key, attempts, "stream down, reconnect attempts exhausted");
                self.error = Some((
                    ErrorOrigin::Stream,
                    SyncError::connection(format!("disconnected: gave up after {attempts} reconnect attempts")),
                ));
            }
            ReconnectDecision::Suppressed => {
                info!(key = %self.key, "stream closed");
            }
        }
        self.publish();
    }

    // -------------------------------------------------------------------------
    // Teardown & publishing
    // -------------------------------------------------------------------------

    async fn shutdown(mut self) {
        self.cancel_fetch();
        self.reconnect_at = None;
        self.connector.disconnect();
        self.close_session();

        if let Some(mut task) = self.session_task.take() {
            if tokio::time::timeout(SESSION_CLOSE_GRACE, &mut task).await.is_err() {
                warn!(key = %self.key, "stream session did not close in time, aborting");
                task.abort();
            }
        }

        self.connector.reset();
        self.buffer = Arc::new(CandleBuffer::new(self.key.timeframe, self.settings.candle_limit));
        self.publish();
        info!(key = %self.key, "market sync stopped");
    }

    fn publish(&mut self) {
        self.revision += 1;
        self.publisher.send_replace(SyncSnapshot {
            key: self.key.clone(),
            candles: Arc::clone(&self.buffer),
            connection: self.connector.state(),
            is_connected: self.connector.is_connected(),
            reconnect_attempts: self.connector.attempts(),
            reconnect_scheduled: self.reconnect_at.is_some(),
            fetching: self.gate.is_in_flight(),
            last_update: self.last_update,
            error: self.error.as_ref().map(|(_, e)| e.clone()),
            revision: self.revision,
        });
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn close_error(cause: &CloseCause) -> SyncError {
    match cause {
        CloseCause::Failed(e) => e.clone(),
        CloseCause::Remote { code: Some(code), reason } => {
            SyncError::connection(format!("stream closed by server (code {code}): {reason}"))
        }
        CloseCause::Remote { code: None, .. } => SyncError::connection("stream ended unexpectedly"),
        CloseCause::Requested => SyncError::connection("stream closed"),
    }
}
