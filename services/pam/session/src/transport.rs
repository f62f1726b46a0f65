//! WebSocket transport for PAM sessions.
//!
//! A [`Connector`] turns an endpoint URL into a [`Transport`]: a boxed sink
//! and stream of [`WireMessage`]s. The production connector speaks WebSocket
//! through `tokio-tungstenite`; the [`memory`] connector pairs the session with
//! an in-process peer for tests and local tooling.

use async_trait::async_trait;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use thiserror::Error;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::debug;
use url::Url;

/// A message on the channel, independent of the WebSocket library
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// UTF-8 text frame
    Text(String),
    /// Transport-level ping
    Ping(Vec<u8>),
    /// Transport-level pong
    Pong(Vec<u8>),
    /// Close frame with an optional reason
    Close(Option<String>),
}

/// Transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The connection could not be established
    #[error("connect failed: {0}")]
    Connect(String),
    /// The server rejected the credential during the upgrade
    #[error("unauthorized (HTTP {0})")]
    Unauthorized(u16),
    /// The endpoint URL cannot be used
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    /// The channel is closed
    #[error("channel closed")]
    Closed,
    /// Read or write failure on an open channel
    #[error("io error: {0}")]
    Io(String),
}

impl TransportError {
    /// Whether retrying the same endpoint can never succeed
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::InvalidEndpoint(_))
    }
}

/// Outgoing half of a channel
pub type WireSink = Pin<Box<dyn Sink<WireMessage, Error = TransportError> + Send>>;

/// Incoming half of a channel
pub type WireStream = Pin<Box<dyn Stream<Item = Result<WireMessage, TransportError>> + Send>>;

/// An open bidirectional channel
pub struct Transport {
    /// Frames to the server
    pub sink: WireSink,
    /// Frames from the server
    pub stream: WireStream,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

/// Opens channels to an endpoint
#[async_trait]
pub trait Connector: Send + Sync {
    /// Perform the opening handshake
    async fn connect(&self, url: &Url) -> Result<Transport, TransportError>;
}

/// WebSocket connector
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &Url) -> Result<Transport, TransportError> {
        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(TransportError::InvalidEndpoint(format!(
                    "unsupported scheme '{}'",
                    other
                )))
            }
        }

        let (socket, _response) = connect_async(url.as_str())
            .await
            .map_err(map_connect_error)?;
        let (sink, stream) = socket.split();

        let sink = sink
            .sink_map_err(map_io_error)
            .with(|message: WireMessage| future::ready(Ok::<_, TransportError>(to_ws(message))));
        let stream = stream.filter_map(|item| {
            future::ready(match item {
                Ok(message) => from_ws(message).map(Ok),
                Err(e) => Some(Err(map_io_error(e))),
            })
        });

        Ok(Transport {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

fn to_ws(message: WireMessage) -> Message {
    match message {
        WireMessage::Text(text) => Message::text(text),
        WireMessage::Ping(data) => Message::Ping(data.into()),
        WireMessage::Pong(data) => Message::Pong(data.into()),
        WireMessage::Close(reason) => Message::Close(reason.map(|reason| CloseFrame {
            code: CloseCode::Normal,
            reason: reason.into(),
        })),
    }
}

fn from_ws(message: Message) -> Option<WireMessage> {
    match message {
        Message::Text(text) => Some(WireMessage::Text(text.as_str().to_string())),
        Message::Binary(data) => match String::from_utf8(data.to_vec()) {
            Ok(text) => Some(WireMessage::Text(text)),
            Err(_) => {
                debug!("Ignoring non-UTF-8 binary frame ({} bytes)", data.len());
                None
            }
        },
        Message::Ping(data) => Some(WireMessage::Ping(data.to_vec())),
        Message::Pong(data) => Some(WireMessage::Pong(data.to_vec())),
        Message::Close(frame) => Some(WireMessage::Close(frame.map(|frame| {
            format!("{} {}", u16::from(frame.code), frame.reason.as_str())
        }))),
        Message::Frame(_) => None,
    }
}

fn map_connect_error(err: WsError) -> TransportError {
    match err {
        WsError::Http(response) => match response.status().as_u16() {
            code @ (401 | 403) => TransportError::Unauthorized(code),
            code => TransportError::Connect(format!("HTTP {}", code)),
        },
        WsError::Url(e) => TransportError::InvalidEndpoint(e.to_string()),
        other => TransportError::Connect(other.to_string()),
    }
}

fn map_io_error(err: WsError) -> TransportError {
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
        other => TransportError::Io(other.to_string()),
    }
}

pub mod memory {
    //! In-process connector.
    //!
    //! Every accepted connection hands a [`MemoryPeer`] to the test, which
    //! plays the server side of the channel.

    use super::{Connector, Transport, TransportError, WireMessage};
    use async_trait::async_trait;
    use futures::channel::mpsc;
    use futures::{SinkExt, StreamExt};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use tokio::sync::mpsc as tokio_mpsc;
    use url::Url;

    /// Scripted result of one connection attempt
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum ConnectOutcome {
        /// Open the channel
        Accept,
        /// Fail with a connect error
        Refuse(String),
        /// Reject the credential
        Unauthorized,
    }

    /// A recorded connection attempt
    #[derive(Debug, Clone)]
    pub struct ConnectAttempt {
        /// Requested endpoint
        pub url: Url,
        /// When the attempt was made
        pub at: tokio::time::Instant,
    }

    #[derive(Debug, Default)]
    struct Script {
        outcomes: VecDeque<ConnectOutcome>,
        attempts: Vec<ConnectAttempt>,
    }

    /// Connector whose attempts follow a script; unscripted attempts are accepted
    #[derive(Debug, Clone)]
    pub struct MemoryConnector {
        script: Arc<Mutex<Script>>,
        peers: tokio_mpsc::UnboundedSender<MemoryPeer>,
    }

    impl MemoryConnector {
        /// Create a connector and the receiver of server-side peers
        pub fn new() -> (Self, tokio_mpsc::UnboundedReceiver<MemoryPeer>) {
            let (peers, rx) = tokio_mpsc::unbounded_channel();
            let connector = Self {
                script: Arc::new(Mutex::new(Script::default())),
                peers,
            };
            (connector, rx)
        }

        /// Script the next unscripted attempt
        pub fn push_outcome(&self, outcome: ConnectOutcome) {
            self.script.lock().outcomes.push_back(outcome);
        }

        /// Attempts made so far
        pub fn attempts(&self) -> Vec<ConnectAttempt> {
            self.script.lock().attempts.clone()
        }

        /// Number of attempts made so far
        pub fn attempt_count(&self) -> usize {
            self.script.lock().attempts.len()
        }
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        async fn connect(&self, url: &Url) -> Result<Transport, TransportError> {
            let outcome = {
                let mut script = self.script.lock();
                script.attempts.push(ConnectAttempt {
                    url: url.clone(),
                    at: tokio::time::Instant::now(),
                });
                script.outcomes.pop_front().unwrap_or(ConnectOutcome::Accept)
            };

            match outcome {
                ConnectOutcome::Accept => {}
                ConnectOutcome::Refuse(reason) => return Err(TransportError::Connect(reason)),
                ConnectOutcome::Unauthorized => return Err(TransportError::Unauthorized(401)),
            }

            let (to_client, client_inbox) = mpsc::unbounded();
            let (client_outbox, from_client) = mpsc::unbounded();

            // A dropped peer receiver just means nobody plays the server
            let _ = self.peers.send(MemoryPeer {
                url: url.clone(),
                to_client,
                from_client: Some(from_client),
            });

            Ok(Transport {
                sink: Box::pin(client_outbox.sink_map_err(|_| TransportError::Closed)),
                stream: Box::pin(client_inbox),
            })
        }
    }

    /// Server side of an in-memory channel
    #[derive(Debug)]
    pub struct MemoryPeer {
        /// Endpoint the client connected to
        pub url: Url,
        to_client: mpsc::UnboundedSender<Result<WireMessage, TransportError>>,
        from_client: Option<mpsc::UnboundedReceiver<WireMessage>>,
    }

    impl MemoryPeer {
        /// Send a text frame; false if the client side is gone
        pub fn send_text(&self, text: impl Into<String>) -> bool {
            self.to_client
                .unbounded_send(Ok(WireMessage::Text(text.into())))
                .is_ok()
        }

        /// Send a transport-level pong
        pub fn send_pong(&self) -> bool {
            self.to_client
                .unbounded_send(Ok(WireMessage::Pong(Vec::new())))
                .is_ok()
        }

        /// Send a close frame
        pub fn close(&self, reason: &str) -> bool {
            self.to_client
                .unbounded_send(Ok(WireMessage::Close(Some(reason.to_string()))))
                .is_ok()
        }

        /// Fail the client's read side
        pub fn fail(&self, reason: &str) -> bool {
            self.to_client
                .unbounded_send(Err(TransportError::Io(reason.to_string())))
                .is_ok()
        }

        /// Next frame from the client, `None` once the client side is closed
        pub async fn recv(&mut self) -> Option<WireMessage> {
            self.from_client.as_mut()?.next().await
        }

        /// Next text frame from the client, skipping control frames
        pub async fn recv_text(&mut self) -> Option<String> {
            loop {
                match self.recv().await? {
                    WireMessage::Text(text) => return Some(text),
                    _ => continue,
                }
            }
        }

        /// Frame already waiting, if any
        pub fn try_recv(&mut self) -> Option<WireMessage> {
            self.from_client.as_mut()?.try_next().ok().flatten()
        }

        /// Stop reading so the client's writes start failing
        pub fn stop_reading(&mut self) {
            self.from_client = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::{ConnectOutcome, MemoryConnector};
    use super::*;

    fn url() -> Url {
        Url::parse("ws://localhost:8000/api/v1/pam/ws/u1?token=t").unwrap()
    }

    #[test]
    fn test_only_invalid_endpoint_is_fatal() {
        assert!(TransportError::InvalidEndpoint("x".into()).is_fatal());
        assert!(!TransportError::Unauthorized(401).is_fatal());
        assert!(!TransportError::Connect("refused".into()).is_fatal());
        assert!(!TransportError::Closed.is_fatal());
    }

    #[test]
    fn test_ws_message_mapping() {
        assert_eq!(
            from_ws(to_ws(WireMessage::Text("hi".into()))),
            Some(WireMessage::Text("hi".into()))
        );
        assert_eq!(
            from_ws(Message::Binary(b"{}".to_vec().into())),
            Some(WireMessage::Text("{}".into()))
        );
        assert_eq!(from_ws(Message::Binary(vec![0xff, 0xfe].into())), None);
        assert_eq!(
            from_ws(to_ws(WireMessage::Close(Some("bye".into())))),
            Some(WireMessage::Close(Some("1000 bye".into())))
        );
    }

    #[tokio::test]
    async fn test_ws_connector_rejects_http_scheme() {
        let url = Url::parse("http://localhost/ws").unwrap();
        let err = WsConnector.connect(&url).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_memory_round_trip() {
        let (connector, mut peers) = MemoryConnector::new();
        let mut transport = connector.connect(&url()).await.unwrap();
        let mut peer = peers.recv().await.unwrap();

        transport.sink.send(WireMessage::Text("up".into())).await.unwrap();
        assert_eq!(peer.recv_text().await.as_deref(), Some("up"));

        assert!(peer.send_text("down"));
        assert_eq!(
            transport.stream.next().await,
            Some(Ok(WireMessage::Text("down".into())))
        );

        drop(peer);
        assert_eq!(transport.stream.next().await, None);
    }

    #[tokio::test]
    async fn test_memory_script_and_attempts() {
        let (connector, _peers) = MemoryConnector::new();
        connector.push_outcome(ConnectOutcome::Refuse("down".into()));
        connector.push_outcome(ConnectOutcome::Unauthorized);

        assert_eq!(
            connector.connect(&url()).await.unwrap_err(),
            TransportError::Connect("down".into())
        );
        assert_eq!(
            connector.connect(&url()).await.unwrap_err(),
            TransportError::Unauthorized(401)
        );
        assert!(connector.connect(&url()).await.is_ok());
        assert_eq!(connector.attempt_count(), 3);
        assert_eq!(connector.attempts()[0].url, url());
    }

    #[tokio::test]
    async fn test_stop_reading_fails_writes() {
        let (connector, mut peers) = MemoryConnector::new();
        let mut transport = connector.connect(&url()).await.unwrap();
        let mut peer = peers.recv().await.unwrap();

        peer.stop_reading();
        let result = transport.sink.send(WireMessage::Text("lost".into())).await;
        assert_eq!(result, Err(TransportError::Closed));
    }
}
