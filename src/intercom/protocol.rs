//! JSON control messages exchanged over `/ws`.
//!
//! Binary WebSocket frames carry audio and are not described here.
//! Every text frame is a JSON object tagged by its `type` field.

use serde::{Deserialize, Serialize};

/// Messages a client may send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    RequestBroadcast,
    StopBroadcast,
}

/// Why a live broadcast ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Timeout,
    UserStopped,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::Timeout => "timeout",
            EndReason::UserStopped => "user_stopped",
        }
    }
}

/// Who holds the live channel, if anyone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastState {
    pub is_active: bool,
    pub active_client: Option<String>,
    pub seconds_remaining: Option<u64>,
}

impl BroadcastState {
    pub fn idle() -> Self {
        Self {
            is_active: false,
            active_client: None,
            seconds_remaining: None,
        }
    }
}

/// Messages the server sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome { client_id: String },
    StateUpdate(BroadcastState),
    BroadcastGranted { client_id: String },
    BroadcastDenied { reason: String },
    BroadcastEnded { reason: EndReason },
    Queued { position: usize },
    QueueFull,
    Error { code: String, message: String },
}

impl ServerMessage {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_messages() {
        let request: ClientMessage =
            serde_json::from_str(r#"{"type":"request_broadcast"}"#).unwrap();
        assert_eq!(request, ClientMessage::RequestBroadcast);

        let stop: ClientMessage =
            serde_json::from_str(r#"{"type":"stop_broadcast","extra":1}"#).unwrap();
        assert_eq!(stop, ClientMessage::StopBroadcast);

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"shout"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>("not json").is_err());
    }

    #[test]
    fn test_server_message_wire_format() {
        let cases = [
            (
                ServerMessage::Welcome { client_id: "a1b2c3d4".into() },
                json!({"type": "welcome", "client_id": "a1b2c3d4"}),
            ),
            (
                ServerMessage::StateUpdate(BroadcastState {
                    is_active: true,
                    active_client: Some("a1b2c3d4".into()),
                    seconds_remaining: Some(12),
                }),
                json!({
                    "type": "state_update",
                    "is_active": true,
                    "active_client": "a1b2c3d4",
                    "seconds_remaining": 12
                }),
            ),
            (
                ServerMessage::StateUpdate(BroadcastState::idle()),
                json!({
                    "type": "state_update",
                    "is_active": false,
                    "active_client": null,
                    "seconds_remaining": null
                }),
            ),
            (
                ServerMessage::BroadcastEnded { reason: EndReason::UserStopped },
                json!({"type": "broadcast_ended", "reason": "user_stopped"}),
            ),
            (
                ServerMessage::Queued { position: 3 },
                json!({"type": "queued", "position": 3}),
            ),
            (ServerMessage::QueueFull, json!({"type": "queue_full"})),
        ];

        for (message, expected) in cases {
            assert_eq!(serde_json::to_value(&message).unwrap(), expected);
        }
    }
}
