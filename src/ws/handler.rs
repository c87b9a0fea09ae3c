//! WebSocket upgrade handler

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::movement::{Direction, RejectReason, SessionEvent, SessionHandle};
use crate::util::rate_limit::ConnectionRateLimiter;
use crate::util::time::unix_millis;
use crate::ws::protocol::{ClientMsg, ServerMsg};

/// How long the writer may keep flushing after the reader stops
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_millis(250);

/// Query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Display name, for logs only
    #[serde(default)]
    pub name: Option<String>,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, query.name, state))
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, name: Option<String>, state: AppState) {
    let connection_id = Uuid::new_v4();
    let name = name.unwrap_or_else(|| "anonymous".to_string());

    let (handle, events) = state.registry.open(
        state.config.speed_profile(false),
        state.config.spawn,
        Direction::South,
    );
    let mobile_id = handle.mobile_id();
    info!(%connection_id, mobile_id, name = %name, "New WebSocket connection");

    let (mut ws_sink, ws_stream) = socket.split();

    let welcome = ServerMsg::Welcome {
        mobile_id,
        server_time: unix_millis(),
        policy: state.config.policy(),
    };
    if let Err(e) = send_msg(&mut ws_sink, &welcome).await {
        error!(mobile_id, error = %e, "Failed to send welcome");
        state.registry.close(mobile_id).await;
        return;
    }

    run_session(&state, handle, ws_sink, ws_stream, events).await;

    // Cleanup on disconnect
    state.registry.close(mobile_id).await;

    info!(%connection_id, mobile_id, "WebSocket connection closed");
}

/// Run the WebSocket session with read/write split
async fn run_session(
    state: &AppState,
    handle: SessionHandle,
    mut ws_sink: futures::stream::SplitSink<WebSocket, Message>,
    mut ws_stream: futures::stream::SplitStream<WebSocket>,
    mut events: mpsc::Receiver<SessionEvent>,
) {
    let mobile_id = handle.mobile_id();
    let rate_limiter = ConnectionRateLimiter::new(state.config.inbound_message_rate);
    let threshold = state.config.violation_disconnect_threshold;
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMsg>(64);

    // Spawn writer task: replies and session events -> WebSocket
    let writer_handle = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                Some(msg) = out_rx.recv() => msg,
                Some(event) = events.recv() => ServerMsg::from(event),
                else => break,
            };
            if let Err(e) = send_msg(&mut ws_sink, &msg).await {
                debug!(mobile_id, error = %e, "WebSocket send failed");
                break;
            }
        }
    });

    // Reader loop: WebSocket -> session actor, until either side goes away
    loop {
        let result = tokio::select! {
            frame = ws_stream.next() => match frame {
                Some(result) => result,
                None => break,
            },
            _ = handle.closed() => {
                info!(mobile_id, "Movement session ended, closing connection");
                break;
            }
        };

        let text = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(_)) => {
                warn!(mobile_id, "Received binary message, ignoring");
                continue;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => {
                info!(mobile_id, "Client initiated close");
                break;
            }
            Err(e) => {
                error!(mobile_id, error = %e, "WebSocket error");
                break;
            }
        };

        if !rate_limiter.check_frame() {
            warn!(mobile_id, "Rate limited inbound frame");
            continue;
        }

        let client_msg = match serde_json::from_str::<ClientMsg>(&text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(mobile_id, error = %e, "Failed to parse client message");
                let _ = out_tx
                    .send(ServerMsg::error("bad_message", e.to_string()))
                    .await;
                continue;
            }
        };

        let reply = match client_msg {
            ClientMsg::EnterWorld => match handle.enter_world().await {
                Ok(()) => None,
                Err(_) => break,
            },
            ClientMsg::Ping { t } => Some(ServerMsg::Pong { t }),
            ClientMsg::Move { .. } => {
                let Some(command) = client_msg.as_command() else {
                    continue;
                };
                match handle.submit(command).await {
                    Ok(scheduled) => Some(ServerMsg::move_ack(&scheduled)),
                    Err(rejection) if rejection.reason == RejectReason::SessionClosed => break,
                    Err(rejection) => {
                        let _ = out_tx
                            .send(ServerMsg::move_reject(command.sequence, &rejection))
                            .await;
                        if threshold > 0 && rejection.violations >= threshold {
                            warn!(
                                mobile_id,
                                violations = rejection.violations,
                                "Movement violation threshold reached, disconnecting"
                            );
                            let _ = out_tx
                                .send(ServerMsg::error(
                                    "protocol_violation",
                                    "Too many movement protocol violations",
                                ))
                                .await;
                            break;
                        }
                        None
                    }
                }
            }
        };

        if let Some(msg) = reply {
            if out_tx.send(msg).await.is_err() {
                debug!(mobile_id, "Writer closed");
                break;
            }
        }
    }

    // Let queued replies flush, then stop the writer
    drop(out_tx);
    handle.disconnect().await;
    let writer_abort = writer_handle.abort_handle();
    if tokio::time::timeout(WRITER_FLUSH_TIMEOUT, writer_handle)
        .await
        .is_err()
    {
        writer_abort.abort();
    }
}

/// Send a message over WebSocket
async fn send_msg(
    sink: &mut futures::stream::SplitSink<WebSocket, Message>,
    msg: &ServerMsg,
) -> Result<(), String> {
    let json = serde_json::to_string(msg).map_err(|e| e.to_string())?;
    sink.send(Message::Text(json))
        .await
        .map_err(|e| e.to_string())
}
