//! Remote agents over WebSocket.
//!
//! The first text frame must be the agent's registration
//! (`{"id", "name", "tier", "capabilities"}`); the gateway answers with
//! `{"type": "registered", "agent_id": ...}`. After that every outbound
//! frame is a serialized hub [`Message`] and every inbound frame is an
//! [`AgentFrame`]. Closing the socket unregisters the agent.

use crate::server::AppState;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use conductor_core::{ConductorError, ConductorResult};
use conductor_hub::{AgentRegistration, Message, MessageType, Recipient, HUB_ID};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);

/// What an agent sends after registering. Only the type is required.
#[derive(Debug, Deserialize)]
pub struct AgentFrame {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub correlation_id: Option<Uuid>,
}

impl AgentFrame {
    fn into_message(self, agent_id: &str) -> Message {
        let mut message = Message::new(
            self.message_type,
            agent_id,
            Recipient::Agent(HUB_ID.to_string()),
            self.payload,
        );
        message.id = self.id;
        message.correlation_id = self.correlation_id;
        message
    }
}

pub async fn agent_socket(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_agent(socket, state))
}

async fn handle_agent(socket: WebSocket, state: Arc<AppState>) {
    let (mut sink, mut stream) = socket.split();

    let registration = match read_registration(&mut stream).await {
        Ok(registration) => registration,
        Err(e) => {
            warn!(error = %e, "Agent socket rejected");
            send_error(&mut sink, &e).await;
            return;
        }
    };
    let agent_id = registration.id.clone();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    if let Err(e) = state.hub.register(registration, tx) {
        send_error(&mut sink, &e).await;
        return;
    }
    let welcome = serde_json::json!({ "type": "registered", "agent_id": agent_id });
    if sink.send(WsMessage::Text(welcome.to_string().into())).await.is_err() {
        state.hub.unregister(&agent_id);
        return;
    }
    info!(agent_id = %agent_id, "Agent socket connected");

    let mut send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Could not encode hub message");
                    continue;
                }
            };
            if sink.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let hub = state.hub.clone();
    let inbound_id = agent_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(frame)) = stream.next().await {
            match frame {
                WsMessage::Text(text) => match serde_json::from_str::<AgentFrame>(text.as_str()) {
                    Ok(frame) => {
                        debug!(agent_id = %inbound_id, message_type = ?frame.message_type, "Agent frame");
                        hub.handle_incoming(&inbound_id, frame.into_message(&inbound_id));
                    }
                    Err(e) => warn!(agent_id = %inbound_id, error = %e, "Malformed agent frame"),
                },
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.hub.unregister(&agent_id);
    info!(agent_id = %agent_id, "Agent socket disconnected");
}

async fn read_registration(stream: &mut SplitStream<WebSocket>) -> ConductorResult<AgentRegistration> {
    let first = tokio::time::timeout(REGISTRATION_TIMEOUT, async {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => return Some(text.as_str().to_string()),
                Ok(WsMessage::Close(_)) | Err(_) => return None,
                Ok(_) => {}
            }
        }
        None
    })
    .await
    .map_err(|_| ConductorError::Timeout("no registration received".to_string()))?
    .ok_or_else(|| ConductorError::Connection("socket closed before registration".to_string()))?;

    serde_json::from_str(&first)
        .map_err(|e| ConductorError::Validation(format!("invalid registration: {e}")))
}

async fn send_error(sink: &mut SplitSink<WebSocket, WsMessage>, error: &ConductorError) {
    let frame = serde_json::json!({
        "type": "error",
        "error": error.kind(),
        "message": error.to_string(),
    });
    let _ = sink.send(WsMessage::Text(frame.to_string().into())).await;
    let _ = sink.close().await;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_defaults() {
        let frame: AgentFrame = serde_json::from_value(serde_json::json!({
            "type": "heartbeat"
        }))
        .unwrap();
        let message = frame.into_message("agent-1");
        assert_eq!(message.message_type, MessageType::Heartbeat);
        assert_eq!(message.from, "agent-1");
        assert!(message.correlation_id.is_none());
        assert_eq!(message.payload, serde_json::Value::Null);
    }

    #[test]
    fn test_frame_keeps_correlation() {
        let ack_for = Uuid::new_v4();
        let frame: AgentFrame = serde_json::from_value(serde_json::json!({
            "type": "task_update",
            "correlation_id": ack_for,
            "payload": {"task_id": Uuid::new_v4(), "status": "accepted"}
        }))
        .unwrap();
        let message = frame.into_message("agent-1");
        assert_eq!(message.correlation_id, Some(ack_for));
        assert_eq!(message.to, Recipient::Agent(HUB_ID.to_string()));
    }
}
