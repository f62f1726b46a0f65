//! Encoding and decoding for the wire protocol.
//!
//! Outbound commands become JSON frames with a `type` discriminant; inbound
//! frames are parsed, their type validated against [`EventType`], and a
//! content hash computed for deduplication.

use crate::error::WireError;
use crate::frame::{
    Command, ContentHash, EventType, InboundEvent, InboundFrame, OutboundFrame, MAX_FRAME_SIZE,
    PING_TYPE,
};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::time::Instant;
use tracing::trace;

/// Encode a validated command into a frame
pub fn encode_command(
    command: &Command,
    client_message_id: &str,
    timestamp: DateTime<Utc>,
) -> Result<String, WireError> {
    command.validate()?;
    encode_frame(&command.kind, &command.payload, client_message_id, timestamp)
}

/// Encode the heartbeat probe
pub fn encode_ping(client_message_id: &str, timestamp: DateTime<Utc>) -> Result<String, WireError> {
    encode_frame(
        PING_TYPE,
        &Value::Object(Map::new()),
        client_message_id,
        timestamp,
    )
}

fn encode_frame(
    kind: &str,
    payload: &Value,
    client_message_id: &str,
    timestamp: DateTime<Utc>,
) -> Result<String, WireError> {
    let frame = OutboundFrame {
        kind: kind.to_string(),
        payload: payload.clone(),
        client_message_id: client_message_id.to_string(),
        timestamp,
    };
    let text = serde_json::to_string(&frame)?;
    if text.len() > MAX_FRAME_SIZE {
        return Err(WireError::Size(text.len()));
    }
    Ok(text)
}

/// Decode an inbound frame into a typed event
pub fn decode_inbound(text: &str, received_at: Instant) -> Result<InboundEvent, WireError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(WireError::Size(text.len()));
    }

    let frame: InboundFrame = serde_json::from_str(text)?;
    let event_type: EventType = frame.kind.parse()?;

    let payload = match frame.payload {
        Value::Null => Value::Object(Map::new()),
        other => other,
    };

    let timestamp = frame.timestamp.as_deref().and_then(|raw| {
        DateTime::parse_from_rfc3339(raw)
            .map(|ts| ts.with_timezone(&Utc))
            .ok()
    });

    let content_hash = content_hash(event_type, &payload);
    trace!("Decoded {} frame (hash {})", event_type, content_hash);

    Ok(InboundEvent {
        event_type,
        payload,
        server_message_id: frame.server_message_id,
        timestamp,
        content_hash,
        received_at,
    })
}

/// Hash an event's type and payload with object keys in sorted order
pub fn content_hash(event_type: EventType, payload: &Value) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(event_type.as_str().as_bytes());
    hasher.update([0u8]);
    write_canonical(payload, &mut hasher);
    ContentHash(hasher.finalize().into())
}

fn write_canonical(value: &Value, hasher: &mut Sha256) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            hasher.update(b"{");
            for key in keys {
                write_string(key, hasher);
                hasher.update(b":");
                write_canonical(&map[key.as_str()], hasher);
                hasher.update(b",");
            }
            hasher.update(b"}");
        }
        Value::Array(items) => {
            hasher.update(b"[");
            for item in items {
                write_canonical(item, hasher);
                hasher.update(b",");
            }
            hasher.update(b"]");
        }
        Value::String(s) => write_string(s, hasher),
        scalar => hasher.update(scalar.to_string().as_bytes()),
    }
}

fn write_string(s: &str, hasher: &mut Sha256) {
    // Length prefix keeps "ab","c" distinct from "a","bc"
    hasher.update((s.len() as u64).to_be_bytes());
    hasher.update(s.as_bytes());
}
