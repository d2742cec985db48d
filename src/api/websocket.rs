//! WebSocket handler for real-time player connections

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::AppState;

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Welcome message on connect
    #[serde(rename = "welcome")]
    Welcome { session_id: String },
    /// Text output to display
    #[serde(rename = "output")]
    Output { text: String },
    /// Error message
    #[serde(rename = "error")]
    Error { message: String },
}

/// Messages sent from client to server
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Player command input
    #[serde(rename = "command")]
    Command { text: String },
    /// Ping to keep connection alive
    #[serde(rename = "ping")]
    Ping,
}

/// Handle WebSocket upgrade
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle an individual WebSocket connection
async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let session_id = uuid::Uuid::new_v4().to_string();
    info!("WebSocket connected: {}", session_id);

    // Send welcome message
    let welcome = ServerMessage::Welcome {
        session_id: session_id.clone(),
    };
    if let Ok(json) = serde_json::to_string(&welcome) {
        let _ = socket.send(Message::Text(json.into())).await;
    }

    let session = match state.dispatcher.open_session(&session_id, tx) {
        Ok(session) => session,
        Err(e) => {
            warn!("Rejecting WebSocket {}: {}", session_id, e);
            let error = ServerMessage::Error {
                message: "The world is not available.".to_string(),
            };
            if let Ok(json) = serde_json::to_string(&error) {
                let _ = socket.send(Message::Text(json.into())).await;
            }
            return;
        }
    };

    // Main loop: relay world output out, client input in
    loop {
        tokio::select! {
            Some(msg) = rx.recv() => {
                if let Ok(json) = serde_json::to_string(&msg) {
                    if socket.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
            }
            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(ClientMessage::Command { text }) => {
                                debug!("Session {} input: {}", session_id, text);
                                if !session.send_line(&text) {
                                    break;
                                }
                            }
                            Ok(ClientMessage::Ping) => {}
                            Err(e) => debug!("Ignoring malformed message from {}: {}", session_id, e),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    _ => {}
                }
            }
        }
    }

    // Dropping the handle lets the world run on_disconnect
    drop(session);
    info!("WebSocket disconnected: {}", session_id);
}
