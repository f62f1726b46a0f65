//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Frame is not valid JSON or is missing required fields
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Inbound frame carries a type this client does not know
    #[error("unknown event type {0:?}")]
    UnknownType(String),

    /// Command type is empty
    #[error("empty command type")]
    EmptyType,

    /// Command type is reserved for the connection layer itself
    #[error("reserved command type {0:?}")]
    ReservedType(String),

    /// Command payload is not a JSON object
    #[error("payload must be a JSON object")]
    PayloadNotObject,

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),
}
