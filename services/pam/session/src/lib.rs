//! WebSocket channel, heartbeat, reconnect backoff, and the session state machine for PAM.
//!
//! This crate provides the connection layer between the Wheels & Wins
//! application and the PAM assistant backend: one [`Session`] per logical
//! conversation, surviving network drops, token expiry, and server restarts.
//!
//! ## Features
//!
//! - **Transport**: WebSocket via `tokio-tungstenite`, or an in-memory peer
//! - **Token refresh**: Fresh credential before connecting when close to expiry
//! - **Keepalive**: Application-level ping with RTT measurement
//! - **Auto-reconnect**: Fixed backoff table with a retry budget
//! - **Offline queue**: Commands buffered while disconnected, replayed in order
//! - **Dedup**: Redelivered server events filtered within a time window
//!
//! ## Example
//!
//! ```rust,no_run
//! use pam_session::{Credential, Session, SessionConfig, StaticTokenProvider};
//! use pam_wire::Command;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = SessionConfig {
//!     base_url: "wss://api.example.com".to_string(),
//!     ..SessionConfig::default()
//! };
//! let tokens = Arc::new(StaticTokenProvider::new(Credential::new("jwt")));
//! let session = Session::builder(config, "user-42", tokens).build()?;
//!
//! let _events = session.on_event(|event| {
//!     if let Some(text) = event.text() {
//!         println!("{}: {}", event.event_type, text);
//!     }
//! });
//!
//! session.open();
//! session.send(Command::chat("Find a campsite near Moab"))?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod auth;
pub mod endpoint;
pub mod keepalive;
pub mod listeners;
mod outbox;
pub mod reconnect;
pub mod session;
pub mod transport;

// Re-export main types
pub use auth::{AuthError, Credential, StaticTokenProvider, TokenProvider};
pub use endpoint::build_endpoint;
pub use keepalive::{HeartbeatVerdict, KeepaliveState};
pub use listeners::{Listeners, Subscription};
pub use reconnect::{default_delays, RetrySchedule};
pub use session::{
    ClientMessageId, ConnectionState, DisconnectReason, ErrorReason, SendError, Session,
    SessionBuilder, SessionConfig, SessionError, SessionStats, StateSnapshot,
};
pub use transport::memory::{ConnectOutcome, MemoryConnector, MemoryPeer};
pub use transport::{Connector, Transport, TransportError, WireMessage, WsConnector};
