//! Wire protocol for the PAM assistant channel.
//!
//! This crate provides the stateless message codec used by the connection
//! layer: outbound commands are written as JSON frames carrying a `type`
//! discriminant, inbound frames are validated against the known event types
//! and fingerprinted for deduplication.
//!
//! ## Wire Format
//!
//! ```text
//! outbound: { "type": string, "payload": object,
//!             "clientMessageId": string, "timestamp": ISO-8601 }
//! inbound:  { "type": string, "payload": object,
//!             "serverMessageId"?: string, "timestamp"?: ISO-8601 }
//! ```
//!
//! Inbound frames with a `type` outside [`EventType`] decode to
//! [`WireError::UnknownType`] so callers can drop them without tearing the
//! connection down.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod frame;

// Re-export main types
pub use codec::{content_hash, decode_inbound, encode_command, encode_ping};
pub use error::WireError;
pub use frame::{
    Command, ContentHash, EventType, InboundEvent, InboundFrame, OutboundFrame, MAX_FRAME_SIZE,
    PING_TYPE,
};
