//! WebSocket handler for device voice channels
//!
//! Wire protocol: inbound binary frames are raw PCM, inbound text frames are
//! control messages (JSON `{"type": ...}` or the bare words `ping`, `stop`,
//! `resume`). Outbound binary frames are reply PCM; outbound text frames are
//! JSON session events.

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};

use super::ApiState;
use crate::session::{ControlCommand, Outbound, SessionEvent};

/// Build the voice WebSocket router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/voice/{device_sn}", get(ws_upgrade))
        .with_state(state)
}

/// Handle WebSocket upgrade request
async fn ws_upgrade(
    State(state): State<Arc<ApiState>>,
    Path(device_sn): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, device_sn))
}

/// Handle one device connection for its lifetime
async fn handle_socket(socket: WebSocket, state: Arc<ApiState>, device_sn: String) {
    let (mut sender, mut receiver) = socket.split();

    // A second channel for an already-connected device is rejected; the
    // existing session stays untouched
    let mut outbound_rx = match state.manager.open(&device_sn).await {
        Ok(rx) => rx,
        Err(e) => {
            tracing::warn!(device_sn = %device_sn, error = %e, "rejecting connection");
            let event = SessionEvent::Error {
                code: "state_conflict".to_string(),
                message: e.to_string(),
            };
            if let Ok(text) = serde_json::to_string(&event) {
                let _ = sender.send(Message::Text(text.into())).await;
            }
            let _ = sender.close().await;
            return;
        }
    };

    tracing::info!(device_sn = %device_sn, "voice channel connected");

    // Forward worker output to the socket
    let mut send_task = tokio::spawn(async move {
        while let Some(outbound) = outbound_rx.recv().await {
            let message = match outbound {
                Outbound::Event(event) => match serde_json::to_string(&event) {
                    Ok(text) => Message::Text(text.into()),
                    Err(e) => {
                        tracing::error!(error = %e, "failed to serialize session event");
                        continue;
                    }
                },
                Outbound::Audio(pcm) => Message::Binary(pcm.into()),
            };
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    // Route inbound frames to the session
    let manager = Arc::clone(&state.manager);
    let sn = device_sn.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            match message {
                Message::Binary(data) => {
                    if manager.route_frame(&sn, data.to_vec()).await.is_err() {
                        break;
                    }
                }
                Message::Text(text) => {
                    if let Some(command) = parse_control(&text) {
                        if manager.control(&sn, command).await.is_err() {
                            break;
                        }
                    } else {
                        tracing::debug!(
                            device_sn = %sn,
                            text = %text.chars().take(120).collect::<String>(),
                            "ignoring unknown control message"
                        );
                    }
                }
                Message::Close(_) => {
                    tracing::info!(device_sn = %sn, "channel closed by device");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    let _ = state.manager.close(&device_sn).await;
    tracing::info!(device_sn = %device_sn, "voice channel disconnected");
}

/// Parse a control frame: bare-word shorthand or tagged JSON
fn parse_control(text: &str) -> Option<ControlCommand> {
    match text.trim() {
        "ping" => Some(ControlCommand::Ping),
        "stop" => Some(ControlCommand::Stop),
        "resume" => Some(ControlCommand::Resume),
        other => serde_json::from_str(other).ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_word_controls_parse() {
        assert_eq!(parse_control("ping"), Some(ControlCommand::Ping));
        assert_eq!(parse_control(" stop "), Some(ControlCommand::Stop));
        assert_eq!(parse_control("resume"), Some(ControlCommand::Resume));
    }

    #[test]
    fn json_controls_parse() {
        assert_eq!(
            parse_control(r#"{"type":"resume"}"#),
            Some(ControlCommand::Resume)
        );
    }

    #[test]
    fn garbage_is_ignored() {
        assert_eq!(parse_control("hello"), None);
        assert_eq!(parse_control(r#"{"type":"reboot"}"#), None);
        assert_eq!(parse_control(""), None);
    }
}
