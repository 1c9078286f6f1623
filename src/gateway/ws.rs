//! WebSocket transport for remote supervisors.
//!
//! Protocol:
//! ```text
//! GET /ws/supervisor?id=intelligence
//! Server -> Client: Envelope JSON addressed to `intelligence` (TASK_REQUEST, pongs, ...)
//! Client -> Server: Envelope JSON (TASK_RESPONSE, HEARTBEAT, ...)
//! ```
//!
//! While connected the peer owns the transport endpoint named by `id`.

use super::AppState;
use crate::coordination::Envelope;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;

#[derive(Deserialize)]
pub struct WsQuery {
    pub id: Option<String>,
}

/// GET /ws/supervisor: WebSocket upgrade for a supervisor endpoint
pub async fn handle_ws_supervisor(
    State(state): State<AppState>,
    Query(params): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let Some(endpoint) = params
        .id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
    else {
        return (
            StatusCode::BAD_REQUEST,
            "Missing endpoint; connect with ?id=<supervisor id>",
        )
            .into_response();
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, endpoint))
        .into_response()
}

async fn handle_socket(socket: WebSocket, state: AppState, endpoint: String) {
    let (mut sender, mut receiver) = socket.split();
    let mut outbound = state.transport.register_mailbox(&endpoint);
    tracing::info!(endpoint = %endpoint, "supervisor connected");

    let forward_endpoint = endpoint.clone();
    let forward = tokio::spawn(async move {
        while let Some(envelope) = outbound.recv().await {
            let text = match serde_json::to_string(&envelope) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(message_id = %envelope.id, "failed to encode envelope: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                tracing::debug!(endpoint = %forward_endpoint, "socket closed while forwarding");
                break;
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            _ => continue,
        };

        match decode_frame(&endpoint, &text) {
            Ok(envelope) => state.router.handle_message(envelope).await,
            Err(e) => tracing::warn!(endpoint = %endpoint, "inbound frame rejected: {e}"),
        }
    }

    forward.abort();
    let _ = forward.await;
    state.transport.prune(&endpoint);
    tracing::info!(endpoint = %endpoint, "supervisor disconnected");
}

#[derive(Debug, thiserror::Error)]
enum FrameError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("sender `{sender}` does not match connected endpoint `{endpoint}`")]
    SenderMismatch { endpoint: String, sender: String },
}

/// Decode one inbound text frame. A peer may only speak as its own endpoint.
fn decode_frame(endpoint: &str, text: &str) -> Result<Envelope, FrameError> {
    let envelope: Envelope = serde_json::from_str(text)?;
    if envelope.sender != endpoint {
        return Err(FrameError::SenderMismatch {
            endpoint: endpoint.to_string(),
            sender: envelope.sender,
        });
    }
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MessageType;
    use serde_json::json;

    #[test]
    fn parses_envelope_frames() {
        let envelope = Envelope::new(MessageType::Heartbeat, "intelligence", "tier0-orchestrator", json!({}));
        let text = serde_json::to_string(&envelope).expect("encode");
        let parsed = decode_frame("intelligence", &text).expect("decode");
        assert_eq!(parsed.id, envelope.id);
        assert_eq!(parsed.message_type, MessageType::Heartbeat);
    }

    #[test]
    fn rejects_non_envelope_frames() {
        let err = decode_frame("intelligence", r#"{"type":"message","content":"hi"}"#)
            .expect_err("not an envelope");
        assert!(matches!(err, FrameError::Malformed(_)));
        assert!(decode_frame("intelligence", "not json").is_err());
    }

    #[test]
    fn rejects_frames_spoken_for_another_supervisor() {
        let spoofed = Envelope::new(MessageType::Heartbeat, "system", "tier0-orchestrator", json!({}));
        let text = serde_json::to_string(&spoofed).expect("encode");
        let err = decode_frame("intelligence", &text).expect_err("sender mismatch");
        assert!(matches!(err, FrameError::SenderMismatch { ref sender, .. } if sender == "system"));
        assert_eq!(
            err.to_string(),
            "sender `system` does not match connected endpoint `intelligence`"
        );
    }
}
