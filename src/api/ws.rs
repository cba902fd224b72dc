// =============================================================================
// WebSocket Handler — Push-based state updates
// =============================================================================
//
// Clients connect to `/api/v1/ws?token=<token>` and receive:
//   1. An immediate full StateSnapshot on connect.
//   2. A fresh snapshot every 500 ms whenever the state_version has changed
//      since the last push (new verdict, settlement, period roll).
//
// A text frame of `snapshot` forces an immediate push. Ping frames are
// answered with Pong.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::api::auth::validate_token;
use crate::app_state::AppState;

const PUSH_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// Validates the `?token=` query parameter before upgrading.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let token = query.token.unwrap_or_default();
    if !validate_token(&token) {
        warn!("WebSocket connection rejected: invalid token");
        return (
            axum::http::StatusCode::FORBIDDEN,
            "Invalid or missing token",
        )
            .into_response();
    }

    info!("WebSocket connection accepted, upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
        .into_response()
}

async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut sequence: u64 = 0;

    if let Err(e) = send_snapshot(&mut sender, &state, &mut sequence).await {
        warn!(error = %e, "Failed to send initial WebSocket snapshot");
        return;
    }
    let mut last_sent_version = state.current_state_version();

    let mut push_interval = interval(PUSH_INTERVAL);

    loop {
        tokio::select! {
            _ = push_interval.tick() => {
                let current_version = state.current_state_version();
                if current_version != last_sent_version {
                    match send_snapshot(&mut sender, &state, &mut sequence).await {
                        Ok(()) => last_sent_version = current_version,
                        Err(e) => {
                            debug!(error = %e, "WebSocket send failed, disconnecting");
                            break;
                        }
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if text.trim().eq_ignore_ascii_case("snapshot") {
                            if let Err(e) = send_snapshot(&mut sender, &state, &mut sequence).await {
                                debug!(error = %e, "WebSocket send failed, disconnecting");
                                break;
                            }
                            last_sent_version = state.current_state_version();
                        } else {
                            debug!(msg = %text, "WebSocket text message ignored");
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(error = %e, "Failed to send Pong, disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Binary(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        info!("WebSocket Close frame received");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error, disconnecting");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    info!(pushed = sequence, "WebSocket connection closed");
}

/// Serialize and send the current StateSnapshot.
async fn send_snapshot<S>(
    sender: &mut S,
    state: &Arc<AppState>,
    sequence: &mut u64,
) -> Result<(), axum::Error>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    let snapshot = state.build_snapshot();

    match serde_json::to_string(&snapshot) {
        Ok(json) => {
            sender.send(Message::Text(json)).await?;
            *sequence += 1;
            debug!(
                version = snapshot.state_version,
                seq = *sequence,
                "WebSocket snapshot sent"
            );
            Ok(())
        }
        Err(e) => {
            // Not a transport failure; keep the connection.
            warn!(error = %e, "Failed to serialize snapshot");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::auth::ADMIN_TOKEN_ENV;
    use fusion_oracle::EngineConfig;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    const TOKEN: &str = "test-admin-token";

    async fn spawn_server() -> SocketAddr {
        std::env::set_var(ADMIN_TOKEN_ENV, TOKEN);
        let state = Arc::new(AppState::new(EngineConfig::default(), None).unwrap());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, crate::api::rest::router(state))
                .await
                .unwrap();
        });
        addr
    }

    /// Send an upgrade request; returns the response head and any bytes
    /// already read past it.
    async fn upgrade(addr: SocketAddr, token: &str) -> (String, Vec<u8>, TcpStream) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET /api/v1/ws?token={token} HTTP/1.1\r\n\
             Host: {addr}\r\n\
             Connection: Upgrade\r\n\
             Upgrade: websocket\r\n\
             Sec-WebSocket-Version: 13\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n"
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed before response head");
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..pos]).into_owned();
                let rest = buf[pos + 4..].to_vec();
                return (head, rest, stream);
            }
        }
    }

    /// Payload offset and length of an unmasked server frame.
    fn frame_header(buf: &[u8]) -> Option<(usize, usize)> {
        if buf.len() < 2 {
            return None;
        }
        match buf[1] & 0x7F {
            126 if buf.len() >= 4 => Some((4, u16::from_be_bytes([buf[2], buf[3]]) as usize)),
            127 if buf.len() >= 10 => {
                let mut len = [0u8; 8];
                len.copy_from_slice(&buf[2..10]);
                Some((10, u64::from_be_bytes(len) as usize))
            }
            126 | 127 => None,
            n => Some((2, n as usize)),
        }
    }

    async fn read_text_frame(stream: &mut TcpStream, mut buf: Vec<u8>) -> String {
        let mut chunk = [0u8; 8192];
        loop {
            if let Some((start, len)) = frame_header(&buf) {
                if buf.len() >= start + len {
                    assert_eq!(buf[0] & 0x0F, 0x1, "expected a text frame");
                    return String::from_utf8(buf[start..start + len].to_vec()).unwrap();
                }
            }
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed before first frame");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    #[tokio::test]
    async fn bad_token_is_refused_before_upgrade() {
        let addr = spawn_server().await;
        let (head, _, _) = tokio::time::timeout(Duration::from_secs(5), upgrade(addr, "wrong"))
            .await
            .unwrap();
        assert!(head.starts_with("HTTP/1.1 403"), "unexpected head: {head}");
    }

    #[tokio::test]
    async fn valid_token_receives_initial_snapshot() {
        let addr = spawn_server().await;
        let (head, rest, mut stream) =
            tokio::time::timeout(Duration::from_secs(5), upgrade(addr, TOKEN))
                .await
                .unwrap();
        assert!(head.starts_with("HTTP/1.1 101"), "unexpected head: {head}");

        let text = tokio::time::timeout(Duration::from_secs(5), read_text_frame(&mut stream, rest))
            .await
            .unwrap();
        let snapshot: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(snapshot["state_version"], 1);
        assert_eq!(snapshot["risk"]["breaker_triggered"], false);
        assert_eq!(snapshot["trust"]["trust_by_source"].as_object().unwrap().len(), 6);
    }
}
