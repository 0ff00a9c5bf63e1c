//! Typed stream events.
//!
//! Every event a producer emits is one of these variants, broadcast to all
//! subscribers under a strictly increasing per-task index. The index is what
//! reconnecting clients send back as `last_index` to resume without gaps or
//! duplicates.

use serde::{Deserialize, Serialize};

/// One event in a task's output stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Generation has started.
    Start {
        model: String,
        assistant_message_id: String,
    },
    /// One incremental chunk of output text.
    Content { text: String },
    /// Full accumulated output so far. Sent once to first-time subscribers
    /// instead of replaying every chunk.
    Accumulated { text: String },
    /// Generation finished; carries the persisted message and billed credits.
    Done {
        message_id: String,
        content: String,
        credits_consumed: i64,
    },
    /// Generation failed. Emitted at most once per task.
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    /// Keep-alive; prevents idle-timeout disconnects at intermediaries.
    Heartbeat,
}

impl StreamEvent {
    /// Serialized size used for the buffer's byte-ceiling eviction.
    pub fn cost_bytes(&self) -> usize {
        serde_json::to_string(self).map(|s| s.len()).unwrap_or(0)
    }

    /// True for `done` / `error`, the last meaningful event of a stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done { .. } | StreamEvent::Error { .. })
    }
}

/// A stream event paired with its buffer index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedEvent {
    pub index: u64,
    #[serde(flatten)]
    pub event: StreamEvent,
}
