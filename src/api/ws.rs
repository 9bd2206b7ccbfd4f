// =============================================================================
// WebSocket Handler — push-based dashboard updates
// =============================================================================
//
// Clients connect to `/api/v1/ws` and receive:
//   1. An immediate DashboardSnapshot on connect.
//   2. A fresh snapshot whenever the combined state version has changed,
//      checked every 500 ms.
//
// The handler also answers Ping frames and bumps the shared
// `ws_sequence_number` on every outbound message.
// =============================================================================

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::app_state::AppState;

const PUSH_INTERVAL: Duration = Duration::from_millis(500);

/// Axum handler for the WebSocket upgrade request.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    info!("dashboard WebSocket accepted, upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

/// Push loop and receive loop for one dashboard client.
async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    let mut sequence: u64 = 0;
    let mut last_sent_version = state.current_state_version();
    if let Err(e) = send_snapshot(&mut sender, &state, &mut sequence).await {
        warn!(error = %e, "failed to send initial dashboard snapshot");
        return;
    }

    let mut push_interval = interval(PUSH_INTERVAL);

    loop {
        tokio::select! {
            _ = push_interval.tick() => {
                let current_version = state.current_state_version();
                if current_version != last_sent_version {
                    if let Err(e) = send_snapshot(&mut sender, &state, &mut sequence).await {
                        debug!(error = %e, "dashboard send failed, disconnecting");
                        break;
                    }
                    last_sent_version = current_version;
                }
            }

            msg = receiver.next() => match msg {
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = sender.send(Message::Pong(data)).await {
                        debug!(error = %e, "failed to send Pong, disconnecting");
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) => {
                    info!("dashboard client closed the connection");
                    break;
                }
                Some(Ok(Message::Text(text))) => {
                    debug!(msg = %text, "dashboard text message ignored");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "dashboard receive error, disconnecting");
                    break;
                }
                None => break,
            },
        }
    }

    info!(sent = sequence, "dashboard WebSocket closed");
}

/// Serialize and send the current snapshot.
async fn send_snapshot<S>(sender: &mut S, state: &Arc<AppState>, sequence: &mut u64) -> Result<(), axum::Error>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    state.ws_sequence_number.fetch_add(1, Ordering::Relaxed);
    *sequence += 1;

    let snapshot = state.build_snapshot();
    match serde_json::to_string(&snapshot) {
        Ok(json) => {
            sender.send(Message::Text(json)).await?;
            debug!(version = snapshot.state_version, seq = *sequence, "dashboard snapshot sent");
            Ok(())
        }
        Err(e) => {
            // Not a transport failure; keep the connection.
            warn!(error = %e, "failed to serialize dashboard snapshot");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ApiClient, LocalStore, StoredCredentials};
    use crate::runtime_config::RuntimeConfig;
    use crate::types::{StreamKey, Timeframe};
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    #[tokio::test]
    async fn pushes_snapshot_on_connect_and_after_changes() {
        let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let offline = closed.local_addr().unwrap();
        drop(closed);

        let config = RuntimeConfig {
            api_url: format!("http://{offline}"),
            streams: Vec::new(),
            max_reconnect_attempts: 0,
            ..RuntimeConfig::default()
        };
        let creds = Arc::new(StoredCredentials::new(Arc::new(LocalStore::new())));
        let api = ApiClient::new(&config.api_url, creds, Duration::from_secs(1)).unwrap();
        let state = Arc::new(AppState::new(config, api));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = crate::api::router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/api/v1/ws"))
            .await
            .unwrap();

        let first = next_snapshot(&mut client).await;
        assert_eq!(first["streams"].as_array().unwrap().len(), 0);

        state.watch(StreamKey::new("EURUSD", Timeframe::H4));
        let pushed = loop {
            let snap = next_snapshot(&mut client).await;
            if !snap["streams"].as_array().unwrap().is_empty() {
                break snap;
            }
        };
        assert_eq!(pushed["streams"][0]["key"]["timeframe"], "4h");
        assert!(pushed["state_version"].as_u64().unwrap() > first["state_version"].as_u64().unwrap());

        client.close(None).await.unwrap();
        state.shutdown().await;
    }

    async fn next_snapshot<S>(client: &mut S) -> serde_json::Value
    where
        S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .expect("no snapshot pushed")
                .expect("stream ended")
                .unwrap();
            if let WsMessage::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }
}
