//! Frame and event types exchanged with the PAM backend.

use crate::error::WireError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

/// Largest frame accepted or produced, in bytes (1 MiB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Command type used by the heartbeat; applications cannot send it
pub const PING_TYPE: &str = "ping";

/// A command the application wants delivered to the backend
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// Discriminant written as the frame `type`
    pub kind: String,
    /// Command body, always a JSON object
    pub payload: Value,
}

impl Command {
    /// Create a command with an arbitrary type
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// A user chat message
    pub fn chat(message: impl Into<String>) -> Self {
        Self::new("chat", json!({ "message": message.into() }))
    }

    /// Push new page/trip context to the assistant
    pub fn context_update(context: Value) -> Self {
        Self::new("context_update", json!({ "context": context }))
    }

    /// Check the command can be put on the wire
    pub fn validate(&self) -> Result<(), WireError> {
        if self.kind.trim().is_empty() {
            return Err(WireError::EmptyType);
        }
        if self.kind == PING_TYPE {
            return Err(WireError::ReservedType(self.kind.clone()));
        }
        if !self.payload.is_object() {
            return Err(WireError::PayloadNotObject);
        }
        Ok(())
    }
}

/// Frame written to the wire for every outbound command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundFrame {
    /// Command discriminant
    #[serde(rename = "type")]
    pub kind: String,
    /// Command body
    pub payload: Value,
    /// Client-generated id, unique per command
    pub client_message_id: String,
    /// Time the command was issued
    pub timestamp: DateTime<Utc>,
}

/// Raw inbound frame before the type is validated
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundFrame {
    /// Event discriminant as sent by the server
    #[serde(rename = "type")]
    pub kind: String,
    /// Event body
    #[serde(default)]
    pub payload: Value,
    /// Server-side id, when the server assigns one
    #[serde(default)]
    pub server_message_id: Option<String>,
    /// Server timestamp; kept as text so a bad value does not sink the frame
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Known inbound event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Streaming fragment of an assistant reply
    ChatDelta,
    /// Final assistant reply
    ChatComplete,
    /// Assistant-requested UI or tool action
    Action,
    /// Server-reported error
    Error,
    /// Heartbeat answer
    Pong,
}

impl EventType {
    /// Wire spelling of the type
    pub const fn as_str(&self) -> &'static str {
        match self {
            EventType::ChatDelta => "chat-delta",
            EventType::ChatComplete => "chat-complete",
            EventType::Action => "action",
            EventType::Error => "error",
            EventType::Pong => "pong",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat-delta" => Ok(EventType::ChatDelta),
            "chat-complete" => Ok(EventType::ChatComplete),
            "action" => Ok(EventType::Action),
            "error" => Ok(EventType::Error),
            "pong" => Ok(EventType::Pong),
            other => Err(WireError::UnknownType(other.to_string())),
        }
    }
}

/// SHA-256 over an event's type and normalized payload
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash(pub [u8; 32]);

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Eight bytes is plenty to tell entries apart in logs
        f.write_str(&hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self)
    }
}

/// A validated server event
#[derive(Debug, Clone)]
pub struct InboundEvent {
    /// Event type
    pub event_type: EventType,
    /// Event body
    pub payload: Value,
    /// Server-side id, if any
    pub server_message_id: Option<String>,
    /// Server timestamp, if present and parseable
    pub timestamp: Option<DateTime<Utc>>,
    /// Dedup key
    pub content_hash: ContentHash,
    /// Local receive time
    pub received_at: Instant,
}

impl InboundEvent {
    /// Text carried by chat events (`content` or `message` field)
    pub fn text(&self) -> Option<&str> {
        self.payload
            .get("content")
            .or_else(|| self.payload.get("message"))
            .and_then(Value::as_str)
    }
}
