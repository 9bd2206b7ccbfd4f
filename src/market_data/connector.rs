// =============================================================================
// Stream Connector — connection state machine with exponential backoff
// =============================================================================
//
// Pure bookkeeping, no I/O. The sync driver feeds it transport events
// (connect started, opened, closed) and it answers with what to do next:
// flush the outbound queue, schedule a reconnect after a delay, or stay down.
//
//   Connecting ──open──▶ Open ──close/error──▶ Closed ──backoff──▶ Connecting
//        │                 │                      ▲
//        └── disconnect ───┴──▶ Closing ──────────┘   (no auto-reconnect)
// =============================================================================

use std::collections::VecDeque;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::types::ConnectionState;

/// WebSocket close code that marks a closure as deliberate.
pub const INTENTIONAL_CLOSE_CODE: u16 = 1000;

/// Reconnect timing and ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    /// `base_delay * 2^attempt`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

/// Why a socket went down.
#[derive(Debug, Clone, PartialEq)]
pub enum CloseCause {
    /// We closed it (disconnect, retarget, stop).
    Requested,
    /// The server sent a close frame or ended the stream.
    Remote { code: Option<u16>, reason: String },
    /// Handshake or read/write failure.
    Failed(SyncError),
}

impl CloseCause {
    pub fn is_intentional(&self) -> bool {
        match self {
            Self::Requested => true,
            Self::Remote { code, .. } => *code == Some(INTENTIONAL_CLOSE_CODE),
            Self::Failed(_) => false,
        }
    }
}

/// Answer to a closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Connect again after `delay`; `attempt` is the new attempt count.
    Retry { attempt: u32, delay: Duration },
    /// Closure was deliberate or auto-reconnect is off.
    Suppressed,
    /// Ceiling reached; stay down until a manual reconnect.
    Exhausted,
}

/// Result of queueing an outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Socket is open, send this now.
    SendNow(String),
    /// Held until the next open.
    Queued,
}

#[derive(Debug)]
pub struct StreamConnector {
    state: ConnectionState,
    attempts: u32,
    auto_reconnect: bool,
    policy: BackoffPolicy,
    pending: VecDeque<String>,
    pending_limit: usize,
}

impl StreamConnector {
    pub fn new(policy: BackoffPolicy, pending_limit: usize) -> Self {
        Self {
            state: ConnectionState::Closed,
            attempts: 0,
            auto_reconnect: false,
            policy,
            pending: VecDeque::new(),
            pending_limit: pending_limit.max(1),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// A connection attempt is starting. Arms auto-reconnect.
    pub fn begin_connect(&mut self) {
        self.state = ConnectionState::Connecting;
        self.auto_reconnect = true;
    }

    /// Handshake succeeded. Resets the attempt counter and returns the queued
    /// messages in FIFO order.
    pub fn on_open(&mut self) -> Vec<String> {
        self.state = ConnectionState::Open;
        self.attempts = 0;
        self.pending.drain(..).collect()
    }

    /// The socket is down. Decides whether and when to reconnect.
    pub fn on_closed(&mut self, cause: &CloseCause) -> ReconnectDecision {
        self.state = ConnectionState::Closed;

        if !self.auto_reconnect || cause.is_intentional() {
            self.auto_reconnect = false;
            debug!(?cause, "closure is intentional, not reconnecting");
            return ReconnectDecision::Suppressed;
        }

        if self.attempts >= self.policy.max_attempts {
            self.auto_reconnect = false;
            warn!(
                attempts = self.attempts,
                max_attempts = self.policy.max_attempts,
                "reconnect attempts exhausted"
            );
            return ReconnectDecision::Exhausted;
        }

        let delay = self.policy.delay_for(self.attempts);
        self.attempts += 1;
        info!(
            attempt = self.attempts,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );
        ReconnectDecision::Retry {
            attempt: self.attempts,
            delay,
        }
    }

    /// Explicit disconnect: resets the counter and disables auto-reconnect.
    /// An open socket passes through `Closing` until its close is observed.
    pub fn disconnect(&mut self) {
        self.attempts = 0;
        self.auto_reconnect = false;
        self.state = match self.state {
            ConnectionState::Open => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        };
    }

    /// Manual reconnect: counter back to zero and connect immediately.
    pub fn manual_reconnect(&mut self) {
        self.attempts = 0;
        self.begin_connect();
    }

    /// Drop all state for a new parameter set.
    pub fn reset(&mut self) {
        self.state = ConnectionState::Closed;
        self.attempts = 0;
        self.auto_reconnect = false;
        self.pending.clear();
    }

    /// Send now when open, otherwise hold (bounded, oldest dropped first).
    pub fn queue(&mut self, msg: String) -> Outbound {
        if self.state == ConnectionState::Open {
            return Outbound::SendNow(msg);
        }
        if self.pending.len() >= self.pending_limit {
            self.pending.pop_front();
            warn!(limit = self.pending_limit, "outbound queue full, dropped oldest message");
        }
        self.pending.push_back(msg);
        Outbound::Queued
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(60),
            max_attempts,
        }
    }

    fn failure() -> CloseCause {
        CloseCause::Failed(SyncError::connection("refused"))
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = BackoffPolicy {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
        };
        assert_eq!(p.delay_for(0), Duration::from_millis(1000));
        assert_eq!(p.delay_for(1), Duration::from_millis(2000));
        assert_eq!(p.delay_for(4), Duration::from_millis(16_000));
        assert_eq!(p.delay_for(5), Duration::from_secs(30));
        assert_eq!(p.delay_for(40), Duration::from_secs(30));
    }

    #[test]
    fn always_failing_connection_gets_exactly_max_attempts() {
        let mut c = StreamConnector::new(policy(5), 16);
        c.begin_connect();

        let mut retries = Vec::new();
        loop {
            match c.on_closed(&failure()) {
                ReconnectDecision::Retry { attempt, delay } => {
                    retries.push((attempt, delay));
                    c.begin_connect();
                }
                ReconnectDecision::Exhausted => break,
                ReconnectDecision::Suppressed => panic!("unexpected suppression"),
            }
        }

        assert_eq!(retries.len(), 5);
        assert_eq!(c.attempts(), 5);
        assert_eq!(c.state(), ConnectionState::Closed);
        let delays: Vec<u64> = retries.iter().map(|(_, d)| d.as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1600]);

        // Stays down afterwards.
        assert_eq!(c.on_closed(&failure()), ReconnectDecision::Suppressed);
    }

    #[test]
    fn manual_reconnect_after_exhaustion_resets_counter() {
        let mut c = StreamConnector::new(policy(2), 16);
        c.begin_connect();
        while let ReconnectDecision::Retry { .. } = c.on_closed(&failure()) {
            c.begin_connect();
        }
        assert_eq!(c.attempts(), 2);

        c.manual_reconnect();
        assert_eq!(c.attempts(), 0);
        assert_eq!(c.state(), ConnectionState::Connecting);

        // Auto-reconnect is armed again, starting from the base delay.
        assert_eq!(
            c.on_closed(&failure()),
            ReconnectDecision::Retry {
                attempt: 1,
                delay: Duration::from_millis(100)
            }
        );
    }

    #[test]
    fn requested_close_never_reconnects() {
        let mut c = StreamConnector::new(policy(5), 16);
        c.begin_connect();
        c.on_open();
        c.disconnect();
        assert_eq!(c.state(), ConnectionState::Closing);
        assert_eq!(c.on_closed(&CloseCause::Requested), ReconnectDecision::Suppressed);
        assert_eq!(c.state(), ConnectionState::Closed);
        assert_eq!(c.attempts(), 0);
    }

    #[test]
    fn remote_close_with_intentional_code_never_reconnects() {
        let mut c = StreamConnector::new(policy(5), 16);
        c.begin_connect();
        c.on_open();
        let cause = CloseCause::Remote {
            code: Some(INTENTIONAL_CLOSE_CODE),
            reason: "bye".into(),
        };
        assert_eq!(c.on_closed(&cause), ReconnectDecision::Suppressed);
    }

    #[test]
    fn remote_close_going_away_reconnects() {
        let mut c = StreamConnector::new(policy(5), 16);
        c.begin_connect();
        c.on_open();
        let cause = CloseCause::Remote {
            code: Some(1001),
            reason: "restart".into(),
        };
        assert!(matches!(c.on_closed(&cause), ReconnectDecision::Retry { attempt: 1, .. }));
    }

    #[test]
    fn disconnect_while_connecting_goes_straight_to_closed() {
        let mut c = StreamConnector::new(policy(5), 16);
        c.begin_connect();
        c.on_closed(&failure());
        c.begin_connect();
        assert_eq!(c.attempts(), 1);
        c.disconnect();
        assert_eq!(c.state(), ConnectionState::Closed);
        assert_eq!(c.attempts(), 0);
        assert_eq!(c.on_closed(&failure()), ReconnectDecision::Suppressed);
    }

    #[test]
    fn open_resets_attempts_and_flushes_fifo() {
        let mut c = StreamConnector::new(policy(5), 16);
        c.begin_connect();
        assert_eq!(c.queue("a".into()), Outbound::Queued);
        assert_eq!(c.queue("b".into()), Outbound::Queued);
        c.on_closed(&failure());
        c.begin_connect();
        assert_eq!(c.attempts(), 1);

        let flushed = c.on_open();
        assert_eq!(flushed, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(c.attempts(), 0);
        assert_eq!(c.pending_len(), 0);
        assert_eq!(c.queue("c".into()), Outbound::SendNow("c".into()));
    }

    #[test]
    fn outbound_queue_drops_oldest_when_full() {
        let mut c = StreamConnector::new(policy(5), 2);
        c.queue("1".into());
        c.queue("2".into());
        c.queue("3".into());
        assert_eq!(c.pending_len(), 2);
        c.begin_connect();
        assert_eq!(c.on_open(), vec!["2".to_string(), "3".to_string()]);
    }

    #[test]
    fn reset_clears_everything() {
        let mut c = StreamConnector::new(policy(5), 4);
        c.queue("x".into());
        c.begin_connect();
        c.on_closed(&failure());
        c.reset();
        assert_eq!(c.state(), ConnectionState::Closed);
        assert_eq!(c.attempts(), 0);
        assert_eq!(c.pending_len(), 0);
    }
}
