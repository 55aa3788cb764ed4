//! WebSocket handler for real-time run event streaming.
//!
//! The `/ws/events` endpoint upgrades an HTTP connection to a WebSocket.
//! Once connected, the handler:
//!
//! - **Forwards events:** Subscribes to the coordinator's [`EventBus`] and
//!   pushes every [`RunEvent`] to the client as a JSON text frame.
//! - **Receives commands:** Parses incoming text frames as [`WsCommand`] to
//!   narrow the stream to one run, widen it again, or answer a ping.
//!
//! Lagged receivers skip events; clients re-fetch the run snapshot to catch up.
//! Disconnecting does not affect any run.
//!
//! [`EventBus`]: loomflow_core::event::bus::EventBus

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use loomflow_types::event::RunEvent;

use crate::state::AppState;

/// Incoming command from a WebSocket client.
///
/// Unknown or malformed messages are logged and ignored.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsCommand {
    /// Only forward events of this run.
    Watch { run_id: Uuid },
    /// Forward events of every run.
    WatchAll,
    /// Keep-alive ping. Server responds with `{"type":"pong"}`.
    Ping,
}

/// Optional initial filter, `?run_id=...`.
#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    pub run_id: Option<Uuid>,
}

/// Upgrade an HTTP request to a WebSocket connection for run events.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state, query.run_id))
}

fn should_forward(event: &RunEvent, filter: Option<Uuid>) -> bool {
    filter.is_none_or(|run_id| event.run_id() == run_id)
}

async fn handle_ws_connection(socket: WebSocket, state: AppState, mut filter: Option<Uuid>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let mut event_rx = state.coordinator.event_bus().subscribe();

    loop {
        tokio::select! {
            event_result = event_rx.recv() => {
                match event_result {
                    Ok(event) => {
                        if !should_forward(&event, filter) {
                            continue;
                        }
                        match serde_json::to_string(&event) {
                            Ok(json) => {
                                if ws_sender.send(Message::Text(json.into())).await.is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                tracing::warn!(error = %err, "failed to serialize run event");
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "websocket subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            msg_result = ws_receiver.next() => {
                match msg_result {
                    Some(Ok(Message::Text(text))) => {
                        if !process_command(&text, &mut ws_sender, &mut filter).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        tracing::debug!(error = %err, "websocket receive error");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    tracing::debug!("websocket connection closed");
}

/// Apply one client command. Returns false once the client is gone.
async fn process_command(
    text: &str,
    ws_sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    filter: &mut Option<Uuid>,
) -> bool {
    let cmd: WsCommand = match serde_json::from_str(text) {
        Ok(cmd) => cmd,
        Err(err) => {
            tracing::debug!(error = %err, "ignoring malformed websocket command");
            return true;
        }
    };

    match cmd {
        WsCommand::Watch { run_id } => {
            *filter = Some(run_id);
            true
        }
        WsCommand::WatchAll => {
            *filter = None;
            true
        }
        WsCommand::Ping => {
            let pong = serde_json::json!({"type": "pong"}).to_string();
            ws_sender.send(Message::Text(pong.into())).await.is_ok()
        }
    }
}
