// SPDX-License-Identifier: MIT
//! WebSocket wire protocol.
//!
//! Every server frame is a [`WsMessage`] envelope: a type tag, a JSON
//! payload, a millisecond timestamp, and optional routing fields. Client
//! frames are the small closed set in [`ClientFrame`]; anything else is
//! answered with an `error` frame rather than a disconnect.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::stream::events::{IndexedEvent, StreamEvent};

/// Server-to-client message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerMessageType {
    ChatStart,
    ChatChunk,
    ChatDone,
    ChatError,
    TaskStatus,
    CreditsChanged,
    Subscribed,
    Unsubscribed,
    Error,
    Ping,
    ServerRestarting,
}

/// Envelope for every frame the server sends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsMessage {
    #[serde(rename = "type")]
    pub message_type: ServerMessageType,
    #[serde(default)]
    pub payload: Value,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Stream buffer index, present on replayable task frames.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_index: Option<i64>,
}

impl WsMessage {
    pub fn new(message_type: ServerMessageType, payload: Value) -> Self {
        Self {
            message_type,
            payload,
            timestamp: Utc::now().timestamp_millis(),
            task_id: None,
            conversation_id: None,
            message_index: None,
        }
    }

    pub fn for_task(
        message_type: ServerMessageType,
        payload: Value,
        task_id: &str,
        conversation_id: Option<&str>,
    ) -> Self {
        Self {
            task_id: Some(task_id.to_string()),
            conversation_id: conversation_id.map(str::to_string),
            ..Self::new(message_type, payload)
        }
    }

    pub fn error(code: &str, message: &str) -> Self {
        Self::new(
            ServerMessageType::Error,
            json!({ "code": code, "message": message }),
        )
    }

    pub fn ping() -> Self {
        Self::new(ServerMessageType::Ping, json!({}))
    }

    pub fn credits_changed(user_balance: i64) -> Self {
        Self::new(
            ServerMessageType::CreditsChanged,
            json!({ "balance": user_balance }),
        )
    }

    pub fn server_restarting() -> Self {
        Self::new(ServerMessageType::ServerRestarting, json!({}))
    }

    /// Serialized frame size, used for buffer byte accounting.
    pub fn cost_bytes(&self) -> usize {
        serde_json::to_string(self).map(|s| s.len()).unwrap_or(0)
    }

    /// Incremental chat text carried by this frame, if it is a chunk.
    pub fn chunk_text(&self) -> Option<&str> {
        if self.message_type == ServerMessageType::ChatChunk {
            self.payload.get("text").and_then(Value::as_str)
        } else {
            None
        }
    }
}

/// Translate a broadcast stream event into its wire frame.
pub fn stream_event_frame(
    task_id: &str,
    conversation_id: Option<&str>,
    indexed: &IndexedEvent,
) -> WsMessage {
    let (message_type, payload) = match &indexed.event {
        StreamEvent::Start {
            model,
            assistant_message_id,
        } => (
            ServerMessageType::ChatStart,
            json!({ "model": model, "assistant_message_id": assistant_message_id }),
        ),
        StreamEvent::Content { text } => {
            (ServerMessageType::ChatChunk, json!({ "text": text }))
        }
        StreamEvent::Accumulated { text } => (
            ServerMessageType::ChatChunk,
            json!({ "text": text, "accumulated": true }),
        ),
        StreamEvent::Done {
            message_id,
            content,
            credits_consumed,
        } => (
            ServerMessageType::ChatDone,
            json!({
                "message_id": message_id,
                "content": content,
                "credits_consumed": credits_consumed,
            }),
        ),
        StreamEvent::Error { message, code } => (
            ServerMessageType::ChatError,
            json!({ "message": message, "code": code }),
        ),
        StreamEvent::Heartbeat => (ServerMessageType::Ping, json!({})),
    };

    let mut frame = WsMessage::for_task(message_type, payload, task_id, conversation_id);
    frame.message_index = Some(indexed.index as i64);
    frame
}

/// Client-to-server frames.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Must be the first frame on every connection.
    Auth {
        user_id: String,
        #[serde(default)]
        token: Option<String>,
    },
    Subscribe {
        task_id: String,
        /// Highest index already seen; -1 (the default) asks for a snapshot.
        #[serde(default = "default_last_index")]
        last_index: i64,
    },
    Unsubscribe {
        task_id: String,
    },
    Pong,
}

fn default_last_index() -> i64 {
    -1
}

impl ClientFrame {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_frame_wire_shape() {
        let frame = WsMessage::for_task(
            ServerMessageType::TaskStatus,
            json!({ "status": "completed" }),
            "t1",
            Some("c1"),
        );
        let value: Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "task_status");
        assert_eq!(value["task_id"], "t1");
        assert_eq!(value["conversation_id"], "c1");
        assert_eq!(value["payload"]["status"], "completed");
        assert!(value["timestamp"].as_i64().unwrap() > 0);
        // Absent routing fields stay off the wire entirely.
        assert!(value.get("message_index").is_none());
    }

    #[test]
    fn chunk_frame_carries_index_and_text() {
        let indexed = IndexedEvent {
            index: 7,
            event: StreamEvent::Content { text: "hey".into() },
        };
        let frame = stream_event_frame("t1", None, &indexed);
        assert_eq!(frame.message_type, ServerMessageType::ChatChunk);
        assert_eq!(frame.message_index, Some(7));
        assert_eq!(frame.chunk_text(), Some("hey"));
    }

    #[test]
    fn client_subscribe_defaults_last_index() {
        let frame =
            ClientFrame::parse(r#"{"type":"subscribe","payload":{"task_id":"t1"}}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Subscribe {
                task_id: "t1".into(),
                last_index: -1
            }
        );

        let resumed = ClientFrame::parse(
            r#"{"type":"subscribe","payload":{"task_id":"t1","last_index":41}}"#,
        )
        .unwrap();
        assert_eq!(
            resumed,
            ClientFrame::Subscribe {
                task_id: "t1".into(),
                last_index: 41
            }
        );
    }

    #[test]
    fn client_pong_without_payload() {
        let frame = ClientFrame::parse(r#"{"type":"pong"}"#).unwrap();
        assert_eq!(frame, ClientFrame::Pong);
    }

    #[test]
    fn unknown_client_type_is_an_error() {
        assert!(ClientFrame::parse(r#"{"type":"mystery","payload":{}}"#).is_err());
    }
}
