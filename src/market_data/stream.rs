// =============================================================================
// Candle stream — WebSocket session I/O and message parsing
// =============================================================================
//
// One session task per connection attempt. The task reports what happens on
// the wire to the sync driver as `SessionEvent`s and writes whatever the
// driver pushes into its outbound channel. Dropping the outbound sender asks
// the session to close with the intentional close code.
// =============================================================================

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::market_data::candle_buffer::Candle;
use crate::market_data::connector::{CloseCause, INTENTIONAL_CLOSE_CODE};
use crate::types::StreamKey;

const CANDLE_UPDATE: &str = "candle_update";

/// What a session observed.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Opened,
    Text(String),
    Closed(CloseCause),
}

/// A [`SessionEvent`] tagged with the session that produced it.
#[derive(Debug, Clone)]
pub struct SessionEnvelope {
    pub session: u64,
    pub event: SessionEvent,
}

/// `{ws_base}/market/stream?symbol=..&timeframe=..[&token=..]`, with every
/// query value percent-encoded.
pub fn stream_url(ws_base: &str, key: &StreamKey, token: Option<&str>) -> SyncResult<String> {
    let raw = format!("{}/market/stream", ws_base.trim_end_matches('/'));
    let mut url = reqwest::Url::parse(&raw)
        .map_err(|e| SyncError::connection(format!("invalid stream url {raw}: {e}")))?;
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("symbol", &key.symbol)
            .append_pair("timeframe", key.timeframe.as_str());
        if let Some(t) = token {
            query.append_pair("token", t);
        }
    }
    Ok(url.into())
}

/// Parse one streamed message.
///
/// Expected shape:
/// ```json
/// { "type": "candle_update",
///   "data": { "timestamp": 1700000000000, "open": 1.07, "high": 1.08,
///             "low": 1.06, "close": 1.075, "volume": 12 } }
/// ```
///
/// Returns `Ok(None)` for any other message type.
pub fn parse_stream_message(text: &str) -> SyncResult<Option<Candle>> {
    let root: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| SyncError::parse(format!("failed to parse stream JSON: {e}")))?;

    let kind = root
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| SyncError::parse("missing field type"))?;
    if kind != CANDLE_UPDATE {
        return Ok(None);
    }

    let data = root
        .get("data")
        .ok_or_else(|| SyncError::parse("missing field data"))?;
    Candle::from_wire(data).map(Some)
}

/// Drive a single WebSocket session until it closes.
pub async fn run_session(
    session: u64,
    key: StreamKey,
    url: String,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    events: mpsc::UnboundedSender<SessionEnvelope>,
) {
    let emit = |event: SessionEvent| {
        let _ = events.send(SessionEnvelope { session, event });
    };

    info!(key = %key, session, "connecting to candle stream");

    // The driver only writes after `Opened`, so anything seen on `outbound`
    // before then is the sender being dropped.
    let connected = tokio::select! {
        res = connect_async(url.as_str()) => res,
        _ = outbound.recv() => {
            debug!(key = %key, session, "connect abandoned");
            emit(SessionEvent::Closed(CloseCause::Requested));
            return;
        }
    };

    let ws = match connected {
        Ok((ws, _response)) => ws,
        Err(e) => {
            warn!(key = %key, session, error = %e, "candle stream connect failed");
            emit(SessionEvent::Closed(CloseCause::Failed(e.into())));
            return;
        }
    };

    info!(key = %key, session, "candle stream connected");
    emit(SessionEvent::Opened);
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            out = outbound.recv() => match out {
                Some(msg) => {
                    if let Err(e) = write.send(msg).await {
                        warn!(key = %key, session, error = %e, "candle stream write failed");
                        emit(SessionEvent::Closed(CloseCause::Failed(e.into())));
                        return;
                    }
                }
                None => {
                    let frame = CloseFrame {
                        code: CloseCode::from(INTENTIONAL_CLOSE_CODE),
                        reason: "client disconnect".into(),
                    };
                    if let Err(e) = write.send(Message::Close(Some(frame))).await {
                        debug!(key = %key, session, error = %e, "close frame not delivered");
                    }
                    info!(key = %key, session, "candle stream closed by client");
                    emit(SessionEvent::Closed(CloseCause::Requested));
                    return;
                }
            },

            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => emit(SessionEvent::Text(text)),
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(f) => (Some(u16::from(f.code)), f.reason.into_owned()),
                        None => (None, String::new()),
                    };
                    info!(key = %key, session, ?code, reason = %reason, "candle stream closed by server");
                    emit(SessionEvent::Closed(CloseCause::Remote { code, reason }));
                    return;
                }
                // tungstenite answers pings itself.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(key = %key, session, error = %e, "candle stream read error");
                    emit(SessionEvent::Closed(CloseCause::Failed(e.into())));
                    return;
                }
                None => {
                    warn!(key = %key, session, "candle stream ended");
                    emit(SessionEvent::Closed(CloseCause::Remote { code: None, reason: String::new() }));
                    return;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timeframe;
    use tokio::net::TcpListener;

    #[test]
    fn candle_update_converts_ms_to_seconds() {
        let text = r#"{"type":"candle_update","data":{"timestamp":100000,"open":1,"high":1.3,"low":0.9,"close":1.15}}"#;
        let candle = parse_stream_message(text).unwrap().unwrap();
        assert_eq!(candle, Candle::new(100, 1.0, 1.3, 0.9, 1.15));
    }

    #[test]
    fn string_fields_and_volume_accepted() {
        let text = r#"{"type":"candle_update","data":{"timestamp":"1700000000000","open":"1.07","high":"1.08","low":"1.06","close":"1.075","volume":"12.5"}}"#;
        let candle = parse_stream_message(text).unwrap().unwrap();
        assert_eq!(candle.time, 1_700_000_000);
        assert_eq!(candle.volume, Some(12.5));
    }

    #[test]
    fn other_types_are_ignored() {
        assert_eq!(parse_stream_message(r#"{"type":"heartbeat"}"#).unwrap(), None);
        assert_eq!(parse_stream_message(r#"{"type":"subscribed","data":{}}"#).unwrap(), None);
    }

    #[test]
    fn malformed_messages_are_parse_errors() {
        for text in [
            "not json",
            r#"{"data":{}}"#,
            r#"{"type":"candle_update"}"#,
            r#"{"type":"candle_update","data":{"timestamp":1,"open":1}}"#,
        ] {
            let err = parse_stream_message(text).unwrap_err();
            assert!(matches!(err, SyncError::Parse { .. }), "{text}: {err:?}");
        }
    }

    #[test]
    fn url_includes_key_and_optional_token() {
        let key = StreamKey::new("EURUSD", Timeframe::M15);
        assert_eq!(
            stream_url("ws://localhost:8000/", &key, None).unwrap(),
            "ws://localhost:8000/market/stream?symbol=EURUSD&timeframe=15m"
        );
        assert_eq!(
            stream_url("ws://h", &key, Some("abc")).unwrap(),
            "ws://h/market/stream?symbol=EURUSD&timeframe=15m&token=abc"
        );
    }

    #[test]
    fn url_encodes_symbol_and_token() {
        let key = StreamKey::new("XAU&USD", Timeframe::M1);
        let url = stream_url("ws://h", &key, Some("ab+c/d==")).unwrap();
        let parsed = reqwest::Url::parse(&url).unwrap();
        let pairs: Vec<(String, String)> = parsed.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("symbol".to_string(), "XAU&USD".to_string()),
                ("timeframe".to_string(), "1m".to_string()),
                ("token".to_string(), "ab+c/d==".to_string()),
            ]
        );
    }

    #[test]
    fn unparseable_base_is_a_connection_error() {
        let key = StreamKey::new("EURUSD", Timeframe::M1);
        let err = stream_url("not a url", &key, None).unwrap_err();
        assert!(matches!(err, SyncError::Connection { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn session_reports_open_text_and_remote_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            ws.send(Message::Text("hello".into())).await.unwrap();
            ws.close(Some(CloseFrame {
                code: CloseCode::Away,
                reason: "restart".into(),
            }))
            .await
            .unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let (_out_tx, out_rx) = mpsc::unbounded_channel();
        let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
        let key = StreamKey::new("EURUSD", Timeframe::M1);
        run_session(3, key, format!("ws://{addr}"), out_rx, ev_tx).await;

        let events: Vec<SessionEvent> = std::iter::from_fn(|| ev_rx.try_recv().ok())
            .inspect(|e| assert_eq!(e.session, 3))
            .map(|e| e.event)
            .collect();
        assert_eq!(
            events,
            vec![
                SessionEvent::Opened,
                SessionEvent::Text("hello".into()),
                SessionEvent::Closed(CloseCause::Remote {
                    code: Some(1001),
                    reason: "restart".into()
                }),
            ]
        );
    }

    #[tokio::test]
    async fn dropping_outbound_sends_intentional_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let mut received = Vec::new();
            while let Some(Ok(msg)) = ws.next().await {
                received.push(msg);
            }
            received
        });

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
        let key = StreamKey::new("EURUSD", Timeframe::M1);
        let session = tokio::spawn(run_session(1, key, format!("ws://{addr}"), out_rx, ev_tx));

        assert_eq!(ev_rx.recv().await.unwrap().event, SessionEvent::Opened);
        out_tx.send(Message::Text("subscribe".into())).unwrap();
        drop(out_tx);
        session.await.unwrap();

        assert_eq!(
            ev_rx.recv().await.unwrap().event,
            SessionEvent::Closed(CloseCause::Requested)
        );

        let received = server.await.unwrap();
        assert_eq!(received[0], Message::Text("subscribe".into()));
        match &received[1] {
            Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), INTENTIONAL_CLOSE_CODE),
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn refused_connect_reports_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (_out_tx, out_rx) = mpsc::unbounded_channel();
        let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
        let key = StreamKey::new("EURUSD", Timeframe::M1);
        run_session(9, key, format!("ws://{addr}"), out_rx, ev_tx).await;

        match ev_rx.recv().await.unwrap().event {
            SessionEvent::Closed(CloseCause::Failed(SyncError::Connection { .. })) => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
