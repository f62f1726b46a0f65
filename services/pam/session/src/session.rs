//! Connection session for the PAM assistant channel.
//!
//! A [`Session`] owns one logical conversation with the backend across any
//! number of physical channels. It opens a channel with a fresh credential,
//! buffers commands while offline, replays them in order once connected,
//! probes the channel with heartbeats, and reconnects with backoff until it
//! either succeeds or gives up with a terminal error.
//!
//! All mutable state sits behind one lock that is never held across an await.
//! Every spawned task carries the epoch it was started for and re-checks it
//! under the lock before acting, so tasks belonging to a discarded channel
//! can never touch the current one.

use crate::auth::{AuthError, Credential, TokenProvider};
use crate::endpoint::{build_endpoint, redact};
use crate::keepalive::{build_ping, HeartbeatVerdict, KeepaliveState};
use crate::listeners::{Listeners, Subscription};
use crate::outbox::{Outbox, OutboxItem};
use crate::reconnect::{default_delays, RetrySchedule};
use crate::transport::{
    Connector, Transport, TransportError, WireMessage, WireSink, WireStream, WsConnector,
};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use pam_storage::{Clock, DedupFilter, OutboundQueue, PendingMessage, SystemClock};
use pam_wire::{decode_inbound, encode_command, Command, EventType, InboundEvent, WireError};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};
use url::Url;
use uuid::Uuid;

/// How long a graceful close may take before the writer gives up
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Id assigned to every outbound command
pub type ClientMessageId = String;

/// Configuration for a PAM session
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// WebSocket base URL, e.g. `wss://api.example.com`
    pub base_url: String,
    /// Path between the base URL and the user id
    pub session_path: String,
    /// Interval between heartbeat pings
    pub ping_interval: Duration,
    /// How long to wait for a pong
    pub pong_timeout: Duration,
    /// Consecutive missed pongs that declare the channel dead
    pub max_missed_pongs: u32,
    /// Backoff table; the last entry repeats
    pub reconnect_delays: Vec<Duration>,
    /// Scheduled retries before giving up; `None` retries forever
    pub max_reconnect_attempts: Option<u32>,
    /// Refresh the token before connecting if it expires within this window
    pub token_refresh_threshold: Duration,
    /// Limit on a single connection attempt
    pub connect_timeout: Duration,
    /// Identical inbound events within this window are dropped
    pub dedup_window: Duration,
    /// Outbound queue capacity
    pub queue_capacity: usize,
    /// Queued commands older than this are dropped before a flush
    pub queue_max_age: Option<Duration>,
    /// Keep queued commands when the session fails terminally
    pub retain_queue_on_error: bool,
}

impl SessionConfig {
    /// Reject settings that would stall the heartbeat or the reconnect loop
    pub fn validate(&self) -> Result<(), SessionError> {
        let zero = |name: &str| SessionError::InvalidConfig(format!("{} must be non-zero", name));
        if self.ping_interval.is_zero() {
            return Err(zero("ping_interval"));
        }
        if self.pong_timeout.is_zero() {
            return Err(zero("pong_timeout"));
        }
        if self.connect_timeout.is_zero() {
            return Err(zero("connect_timeout"));
        }
        if self.max_missed_pongs == 0 {
            return Err(zero("max_missed_pongs"));
        }
        if let Some(index) = self.reconnect_delays.iter().position(Duration::is_zero) {
            return Err(SessionError::InvalidConfig(format!(
                "reconnect_delays[{}] must be non-zero",
                index
            )));
        }
        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            base_url: "ws://localhost:8000".to_string(),
            session_path: "api/v1/pam/ws".to_string(),
            ping_interval: Duration::from_secs(20),
            pong_timeout: Duration::from_secs(10),
            max_missed_pongs: 2,
            reconnect_delays: default_delays(),
            max_reconnect_attempts: Some(10),
            token_refresh_threshold: Duration::from_secs(5 * 60),
            connect_timeout: Duration::from_secs(10),
            dedup_window: Duration::from_secs(5),
            queue_capacity: 256,
            queue_max_age: Some(Duration::from_secs(5 * 60)),
            retain_queue_on_error: false,
        }
    }
}

/// Connection state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not connected and not trying to be
    Disconnected,
    /// A connection attempt is in progress
    Connecting,
    /// A channel is open
    Connected,
    /// Waiting for the next attempt after a failure
    Reconnecting,
    /// Automatic recovery has stopped
    Error,
}

impl ConnectionState {
    /// Lowercase name
    pub const fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session entered the error state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorReason {
    /// The credential was rejected or could not be obtained
    AuthFailed,
    /// The retry budget ran out
    MaxRetriesExceeded,
    /// The endpoint can never be reached as configured
    TransportUnavailable,
}

impl ErrorReason {
    /// Snake-case name
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorReason::AuthFailed => "auth_failed",
            ErrorReason::MaxRetriesExceeded => "max_retries_exceeded",
            ErrorReason::TransportUnavailable => "transport_unavailable",
        }
    }
}

impl fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a channel went away
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Too many heartbeats went unanswered
    HeartbeatTimeout {
        /// Consecutive misses
        missed: u32,
    },
    /// The server closed the channel
    ClosedByPeer(Option<String>),
    /// Read or write failure
    Transport(String),
    /// The attempt never produced a channel
    ConnectFailed(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::HeartbeatTimeout { missed } => {
                write!(f, "heartbeat timeout ({} missed)", missed)
            }
            DisconnectReason::ClosedByPeer(Some(reason)) => write!(f, "closed by peer: {}", reason),
            DisconnectReason::ClosedByPeer(None) => f.write_str("closed by peer"),
            DisconnectReason::Transport(e) => write!(f, "transport error: {}", e),
            DisconnectReason::ConnectFailed(e) => write!(f, "connect failed: {}", e),
        }
    }
}

/// State published to watchers and state listeners
#[derive(Debug, Clone, PartialEq)]
pub struct StateSnapshot {
    /// Current state
    pub state: ConnectionState,
    /// Set in the error state
    pub reason: Option<ErrorReason>,
    /// Cause of the last drop, set while reconnecting
    pub disconnect: Option<DisconnectReason>,
    /// Human-readable diagnostic
    pub detail: Option<String>,
}

impl StateSnapshot {
    fn new(state: ConnectionState) -> Self {
        Self {
            state,
            reason: None,
            disconnect: None,
            detail: None,
        }
    }

    fn reconnecting(cause: DisconnectReason, delay: Duration) -> Self {
        Self {
            state: ConnectionState::Reconnecting,
            reason: None,
            detail: Some(format!("{}; retrying in {:?}", cause, delay)),
            disconnect: Some(cause),
        }
    }

    fn error(reason: ErrorReason, detail: String) -> Self {
        Self {
            state: ConnectionState::Error,
            reason: Some(reason),
            disconnect: None,
            detail: Some(detail),
        }
    }
}

/// Counters for a session
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionStats {
    /// Frames written, heartbeats included
    pub frames_sent: u64,
    /// Text frames read
    pub frames_received: u64,
    /// Inbound events dropped as duplicates
    pub duplicates_dropped: u64,
    /// Inbound frames with an unknown type
    pub unknown_dropped: u64,
    /// Inbound frames that failed to parse
    pub malformed_dropped: u64,
    /// Queued commands evicted by overflow
    pub queue_overflow_dropped: u64,
    /// Queued commands dropped for age
    pub queue_expired_dropped: u64,
    /// Channels opened
    pub connects: u64,
    /// Most recent heartbeat round trip
    pub last_rtt: Option<Duration>,
}

/// Errors delivered to error listeners
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    /// The session stopped recovering on its own
    #[error("session failed ({reason}): {detail}")]
    Terminal {
        /// Category
        reason: ErrorReason,
        /// Diagnostic
        detail: String,
    },
    /// A command was rejected before reaching the queue
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    /// The session was built outside a Tokio runtime
    #[error("no Tokio runtime: {0}")]
    Runtime(String),
    /// The configuration cannot drive a session
    #[error("invalid session config: {0}")]
    InvalidConfig(String),
}

/// Errors returned by [`Session::send`]
#[derive(Error, Debug)]
pub enum SendError {
    /// The command cannot be encoded
    #[error("invalid command: {0}")]
    Invalid(#[from] WireError),
}

enum Notification {
    Event(InboundEvent),
    State(StateSnapshot),
    Error(SessionError),
}

#[derive(Default)]
struct Registries {
    events: Listeners<InboundEvent>,
    states: Listeners<StateSnapshot>,
    errors: Listeners<SessionError>,
}

struct ActiveChannel {
    id: u64,
    url: Url,
    opened_at: DateTime<Utc>,
    outbox: Arc<Outbox>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

struct Inner {
    state: ConnectionState,
    epoch: u64,
    channel: Option<ActiveChannel>,
    schedule: RetrySchedule,
    queue: OutboundQueue,
    dedup: DedupFilter,
    keepalive: KeepaliveState,
    driver: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    auth_retry_used: bool,
    last_activity: Option<DateTime<Utc>>,
    stats: SessionStats,
    next_channel_id: u64,
}

struct Shared {
    config: SessionConfig,
    session_id: String,
    user_id: String,
    tokens: Arc<dyn TokenProvider>,
    connector: Arc<dyn Connector>,
    clock: Arc<dyn Clock>,
    runtime: Handle,
    inner: Mutex<Inner>,
    notify_tx: mpsc::UnboundedSender<Notification>,
    state_tx: watch::Sender<StateSnapshot>,
}

/// Builder for [`Session`]
pub struct SessionBuilder {
    config: SessionConfig,
    user_id: String,
    tokens: Arc<dyn TokenProvider>,
    session_id: Option<String>,
    connector: Option<Arc<dyn Connector>>,
    clock: Option<Arc<dyn Clock>>,
}

impl SessionBuilder {
    /// Use a known session id instead of a generated one
    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Use a custom connector instead of WebSocket
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Use a custom clock for dedup and queue aging
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Create the session in the `Disconnected` state
    ///
    /// Must be called from within a Tokio runtime; the session spawns its
    /// tasks on that runtime.
    pub fn build(self) -> Result<Session, SessionError> {
        self.config.validate()?;
        let runtime = Handle::try_current().map_err(|e| SessionError::Runtime(e.to_string()))?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let config = self.config;

        let inner = Inner {
            state: ConnectionState::Disconnected,
            epoch: 0,
            channel: None,
            schedule: RetrySchedule::new(
                config.reconnect_delays.clone(),
                config.max_reconnect_attempts,
            ),
            queue: OutboundQueue::new(config.queue_capacity, config.queue_max_age),
            dedup: DedupFilter::new(config.dedup_window, Arc::clone(&clock)),
            keepalive: KeepaliveState::new(config.max_missed_pongs),
            driver: None,
            heartbeat: None,
            auth_retry_used: false,
            last_activity: None,
            stats: SessionStats::default(),
            next_channel_id: 0,
        };

        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(StateSnapshot::new(ConnectionState::Disconnected));
        let registries = Arc::new(Registries::default());
        runtime.spawn(dispatch(Arc::clone(&registries), notify_rx));

        let shared = Arc::new(Shared {
            config,
            session_id: self
                .session_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            user_id: self.user_id,
            tokens: self.tokens,
            connector: self.connector.unwrap_or_else(|| Arc::new(WsConnector)),
            clock,
            runtime,
            inner: Mutex::new(inner),
            notify_tx,
            state_tx,
        });

        info!(
            "Created PAM session {} for user {}",
            shared.session_id, shared.user_id
        );
        Ok(Session { shared, registries })
    }
}

/// One logical PAM conversation
///
/// Dropping the session closes it.
pub struct Session {
    shared: Arc<Shared>,
    registries: Arc<Registries>,
}

impl Session {
    /// Start building a session
    pub fn builder(
        config: SessionConfig,
        user_id: impl Into<String>,
        tokens: Arc<dyn TokenProvider>,
    ) -> SessionBuilder {
        SessionBuilder {
            config,
            user_id: user_id.into(),
            tokens,
            session_id: None,
            connector: None,
            clock: None,
        }
    }

    /// Start connecting; no-op while connecting, connected, or reconnecting
    pub fn open(&self) {
        let shared = &self.shared;
        let mut inner = shared.inner.lock();
        match inner.state {
            ConnectionState::Connecting
            | ConnectionState::Connected
            | ConnectionState::Reconnecting => {
                debug!(
                    "Session {} already {}, ignoring open",
                    shared.session_id, inner.state
                );
                return;
            }
            ConnectionState::Disconnected | ConnectionState::Error => {}
        }

        inner.schedule.reset();
        inner.auth_retry_used = false;
        inner.epoch += 1;
        let epoch = inner.epoch;
        info!("Opening session {}", shared.session_id);
        shared.set_state(&mut inner, StateSnapshot::new(ConnectionState::Connecting));
        inner.driver = Some(
            shared
                .runtime
                .spawn(Arc::clone(shared).drive_connect(epoch, None)),
        );
    }

    /// Queue a command, writing it right away when connected
    pub fn send(&self, command: Command) -> Result<ClientMessageId, SendError> {
        let shared = &self.shared;
        let client_message_id = Uuid::new_v4().to_string();
        let payload = match encode_command(&command, &client_message_id, Utc::now()) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Rejected command '{}': {}", command.kind, e);
                let _ = shared
                    .notify_tx
                    .send(Notification::Error(SessionError::InvalidCommand(e.to_string())));
                return Err(e.into());
            }
        };

        let mut inner = shared.inner.lock();
        let message = PendingMessage::new(client_message_id.clone(), payload, shared.clock.now());
        inner.queue.enqueue(message);
        if inner.state == ConnectionState::Connected {
            shared.flush_locked(&mut inner);
        } else {
            debug!(
                "Session {} is {}, holding command {}",
                shared.session_id, inner.state, client_message_id
            );
        }
        Ok(client_message_id)
    }

    /// Close the channel and stop reconnecting; queued commands are kept
    pub fn close(&self) {
        let shared = &self.shared;
        let mut inner = shared.inner.lock();
        inner.epoch += 1;
        if let Some(driver) = inner.driver.take() {
            driver.abort();
        }
        shared.teardown_channel(&mut inner, true);
        if inner.state != ConnectionState::Disconnected {
            info!("Closed session {}", shared.session_id);
            shared.set_state(&mut inner, StateSnapshot::new(ConnectionState::Disconnected));
        }
    }

    /// Listen for inbound events in wire order
    pub fn on_event<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&InboundEvent) + Send + Sync + 'static,
    {
        self.registries.events.subscribe(listener)
    }

    /// Listen for state changes
    pub fn on_state_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&StateSnapshot) + Send + Sync + 'static,
    {
        self.registries.states.subscribe(listener)
    }

    /// Listen for session errors
    pub fn on_error<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SessionError) + Send + Sync + 'static,
    {
        self.registries.errors.subscribe(listener)
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().state
    }

    /// Watch state snapshots
    pub fn watch_state(&self) -> watch::Receiver<StateSnapshot> {
        self.shared.state_tx.subscribe()
    }

    /// Counters
    pub fn stats(&self) -> SessionStats {
        let inner = self.shared.inner.lock();
        SessionStats {
            duplicates_dropped: inner.dedup.dropped(),
            queue_overflow_dropped: inner.queue.overflow_dropped(),
            queue_expired_dropped: inner.queue.expired_dropped(),
            last_rtt: inner.keepalive.last_rtt(),
            ..inner.stats.clone()
        }
    }

    /// Commands waiting for a channel
    pub fn pending_count(&self) -> usize {
        self.shared.inner.lock().queue.len()
    }

    /// Session id
    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    /// User id
    pub fn user_id(&self) -> &str {
        &self.shared.user_id
    }

    /// Last time a frame was read or written
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.shared.inner.lock().last_activity
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.shared.session_id)
            .field("user_id", &self.shared.user_id)
            .field("state", &self.state())
            .finish()
    }
}

async fn dispatch(registries: Arc<Registries>, mut rx: mpsc::UnboundedReceiver<Notification>) {
    while let Some(notification) = rx.recv().await {
        match notification {
            Notification::Event(event) => {
                registries.events.emit(&event);
            }
            Notification::State(snapshot) => {
                registries.states.emit(&snapshot);
            }
            Notification::Error(err) => {
                registries.errors.emit(&err);
            }
        }
    }
    debug!("Notification dispatcher stopped");
}

impl Shared {
    fn set_state(&self, inner: &mut Inner, snapshot: StateSnapshot) {
        debug!(
            "Session {} state {} -> {}",
            self.session_id, inner.state, snapshot.state
        );
        inner.state = snapshot.state;
        self.state_tx.send_replace(snapshot.clone());
        let _ = self.notify_tx.send(Notification::State(snapshot));
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.inner.lock().epoch == epoch
    }

    /// Claim the single forced-refresh retry allowed per connect cycle
    fn use_auth_retry(&self, epoch: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.epoch != epoch || inner.auth_retry_used {
            return false;
        }
        inner.auth_retry_used = true;
        true
    }

    async fn obtain_credential(&self, force_refresh: bool) -> Result<Credential, AuthError> {
        if force_refresh {
            info!("Refreshing token for session {}", self.session_id);
            return self.bounded("token refresh", self.tokens.refresh_token()).await;
        }

        let current = self
            .bounded("token lookup", self.tokens.current_token())
            .await?;
        if current.expires_within(self.config.token_refresh_threshold, Utc::now()) {
            info!(
                "Token for session {} expires soon, refreshing before connect",
                self.session_id
            );
            return self.bounded("token refresh", self.tokens.refresh_token()).await;
        }
        Ok(current)
    }

    /// Token provider calls share the connect timeout
    async fn bounded<F>(&self, what: &str, call: F) -> Result<Credential, AuthError>
    where
        F: Future<Output = Result<Credential, AuthError>>,
    {
        match timeout(self.config.connect_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(AuthError::Unavailable(format!(
                "{} timed out after {:?}",
                what, self.config.connect_timeout
            ))),
        }
    }

    async fn drive_connect(self: Arc<Self>, epoch: u64, delay: Option<Duration>) {
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
            let mut inner = self.inner.lock();
            if inner.epoch != epoch || inner.state != ConnectionState::Reconnecting {
                return;
            }
            self.set_state(&mut inner, StateSnapshot::new(ConnectionState::Connecting));
        }

        let mut force_refresh = false;
        loop {
            let credential = match self.obtain_credential(force_refresh).await {
                Ok(credential) => credential,
                Err(e) => {
                    warn!("Session {} could not get a token: {}", self.session_id, e);
                    if self.use_auth_retry(epoch) {
                        force_refresh = true;
                        continue;
                    }
                    self.fail(epoch, ErrorReason::AuthFailed, e.to_string());
                    return;
                }
            };

            let url = match build_endpoint(
                &self.config.base_url,
                &self.config.session_path,
                &self.user_id,
                &credential.token,
            ) {
                Ok(url) => url,
                Err(e) => {
                    self.fail(epoch, ErrorReason::TransportUnavailable, e.to_string());
                    return;
                }
            };

            if !self.is_current(epoch) {
                return;
            }

            debug!("Session {} connecting to {}", self.session_id, redact(&url));
            let result = match timeout(self.config.connect_timeout, self.connector.connect(&url)).await
            {
                Ok(result) => result,
                Err(_) => Err(TransportError::Connect(format!(
                    "timed out after {:?}",
                    self.config.connect_timeout
                ))),
            };

            match result {
                Ok(transport) => {
                    self.channel_opened(epoch, url, transport);
                    return;
                }
                Err(TransportError::Unauthorized(status)) => {
                    warn!(
                        "Session {} credential rejected (HTTP {})",
                        self.session_id, status
                    );
                    if self.use_auth_retry(epoch) {
                        force_refresh = true;
                        continue;
                    }
                    self.fail(
                        epoch,
                        ErrorReason::AuthFailed,
                        format!("credential rejected (HTTP {})", status),
                    );
                    return;
                }
                Err(e) if e.is_fatal() => {
                    self.fail(epoch, ErrorReason::TransportUnavailable, e.to_string());
                    return;
                }
                Err(e) => {
                    warn!("Session {} connect failed: {}", self.session_id, e);
                    self.schedule_reconnect(epoch, DisconnectReason::ConnectFailed(e.to_string()));
                    return;
                }
            }
        }
    }

    fn channel_opened(self: &Arc<Self>, epoch: u64, url: Url, transport: Transport) {
        let mut inner = self.inner.lock();
        if inner.epoch != epoch || inner.state != ConnectionState::Connecting {
            debug!("Session {} discarding stale channel", self.session_id);
            return;
        }

        inner.schedule.reset();
        inner.auth_retry_used = false;
        inner.next_channel_id += 1;
        let id = inner.next_channel_id;

        let Transport { sink, stream } = transport;
        let outbox = Arc::new(Outbox::new());
        let writer = self
            .runtime
            .spawn(Arc::clone(self).run_writer(epoch, sink, Arc::clone(&outbox)));
        let reader = self.runtime.spawn(Arc::clone(self).run_reader(epoch, stream));

        info!(
            "Session {} connected on channel {} ({})",
            self.session_id,
            id,
            redact(&url)
        );
        inner.channel = Some(ActiveChannel {
            id,
            url,
            opened_at: Utc::now(),
            outbox,
            reader,
            writer,
        });
        inner.driver = None;
        inner.stats.connects += 1;
        inner.keepalive.reset();
        inner.last_activity = Some(Utc::now());
        self.set_state(&mut inner, StateSnapshot::new(ConnectionState::Connected));

        let now = self.clock.now();
        inner.queue.expire(now);
        self.flush_locked(&mut inner);

        inner.heartbeat = Some(self.runtime.spawn(Arc::clone(self).run_heartbeat(epoch)));
    }

    fn flush_locked(&self, inner: &mut Inner) {
        let Some(outbox) = inner.channel.as_ref().map(|c| Arc::clone(&c.outbox)) else {
            return;
        };
        let outcome = inner.queue.flush(|message| outbox.push_frame(message));
        if outcome.sent > 0 {
            debug!(
                "Session {} handed {} commands to the writer ({} left)",
                self.session_id, outcome.sent, outcome.remaining
            );
        }
    }

    fn teardown_channel(&self, inner: &mut Inner, graceful: bool) {
        if let Some(heartbeat) = inner.heartbeat.take() {
            heartbeat.abort();
        }
        inner.keepalive.reset();

        let Some(channel) = inner.channel.take() else {
            return;
        };
        channel.reader.abort();
        let unsent = channel.outbox.detach(graceful);
        if !graceful {
            channel.writer.abort();
        }
        let lifetime = Utc::now() - channel.opened_at;
        debug!(
            "Session {} closed channel {} to {} after {}s",
            self.session_id,
            channel.id,
            redact(&channel.url),
            lifetime.num_seconds()
        );
        if !unsent.is_empty() {
            debug!(
                "Session {} re-queued {} unsent commands",
                self.session_id,
                unsent.len()
            );
            inner.queue.requeue_front(unsent);
        }
    }

    fn channel_lost(self: &Arc<Self>, epoch: u64, cause: DisconnectReason) {
        let mut inner = self.inner.lock();
        if inner.epoch != epoch || inner.state != ConnectionState::Connected {
            return;
        }
        warn!("Session {} lost its channel: {}", self.session_id, cause);
        self.teardown_channel(&mut inner, false);
        self.schedule_reconnect_locked(&mut inner, cause);
    }

    fn schedule_reconnect(self: &Arc<Self>, epoch: u64, cause: DisconnectReason) {
        let mut inner = self.inner.lock();
        if inner.epoch != epoch {
            return;
        }
        self.schedule_reconnect_locked(&mut inner, cause);
    }

    fn schedule_reconnect_locked(self: &Arc<Self>, inner: &mut Inner, cause: DisconnectReason) {
        let Some(delay) = inner.schedule.next_delay() else {
            let detail = format!(
                "gave up after {} reconnect attempts: {}",
                inner.schedule.attempt_index(),
                cause
            );
            self.fail_locked(inner, ErrorReason::MaxRetriesExceeded, detail);
            return;
        };

        inner.epoch += 1;
        let epoch = inner.epoch;
        info!(
            "Session {} reconnecting in {:?} (attempt {})",
            self.session_id,
            delay,
            inner.schedule.attempt_index()
        );
        self.set_state(inner, StateSnapshot::reconnecting(cause, delay));
        inner.driver = Some(
            self.runtime
                .spawn(Arc::clone(self).drive_connect(epoch, Some(delay))),
        );
    }

    fn fail(&self, epoch: u64, reason: ErrorReason, detail: String) {
        let mut inner = self.inner.lock();
        if inner.epoch != epoch {
            return;
        }
        self.fail_locked(&mut inner, reason, detail);
    }

    fn fail_locked(&self, inner: &mut Inner, reason: ErrorReason, detail: String) {
        inner.epoch += 1;
        // Only the driver itself or a channel task gets here, so detach rather than abort
        inner.driver = None;
        self.teardown_channel(inner, false);
        if !self.config.retain_queue_on_error {
            let dropped = inner.queue.clear();
            if dropped > 0 {
                warn!(
                    "Session {} discarded {} queued commands",
                    self.session_id, dropped
                );
            }
        }

        error!("Session {} failed ({}): {}", self.session_id, reason, detail);
        self.set_state(inner, StateSnapshot::error(reason, detail.clone()));
        let _ = self
            .notify_tx
            .send(Notification::Error(SessionError::Terminal { reason, detail }));
    }

    async fn run_reader(self: Arc<Self>, epoch: u64, mut stream: WireStream) {
        while let Some(item) = stream.next().await {
            match item {
                Ok(WireMessage::Text(text)) => self.handle_text(epoch, &text),
                Ok(WireMessage::Pong(_)) => self.handle_pong(epoch),
                Ok(WireMessage::Ping(_)) => trace!("Transport ping on session {}", self.session_id),
                Ok(WireMessage::Close(reason)) => {
                    self.channel_lost(epoch, DisconnectReason::ClosedByPeer(reason));
                    return;
                }
                Err(e) => {
                    self.channel_lost(epoch, DisconnectReason::Transport(e.to_string()));
                    return;
                }
            }
        }
        self.channel_lost(epoch, DisconnectReason::ClosedByPeer(None));
    }

    fn handle_text(&self, epoch: u64, text: &str) {
        let mut inner = self.inner.lock();
        if inner.epoch != epoch {
            return;
        }
        inner.stats.frames_received += 1;
        inner.last_activity = Some(Utc::now());

        let event = match decode_inbound(text, self.clock.now()) {
            Ok(event) => event,
            Err(WireError::UnknownType(kind)) => {
                inner.stats.unknown_dropped += 1;
                warn!(
                    "Session {} dropping frame with unknown type {:?}",
                    self.session_id, kind
                );
                return;
            }
            Err(e) => {
                inner.stats.malformed_dropped += 1;
                warn!("Session {} dropping frame: {}", self.session_id, e);
                return;
            }
        };

        if event.event_type == EventType::Pong {
            let now = self.clock.now();
            if let Some(rtt) = inner.keepalive.record_pong(now) {
                trace!("Session {} heartbeat rtt {:?}", self.session_id, rtt);
            }
            return;
        }

        if !inner.dedup.admit(event.content_hash) {
            debug!(
                "Session {} dropped duplicate {} ({})",
                self.session_id, event.event_type, event.content_hash
            );
            return;
        }

        let _ = self.notify_tx.send(Notification::Event(event));
    }

    fn handle_pong(&self, epoch: u64) {
        let mut inner = self.inner.lock();
        if inner.epoch != epoch {
            return;
        }
        let now = self.clock.now();
        inner.keepalive.record_pong(now);
    }

    fn record_sent(&self, epoch: u64) {
        let mut inner = self.inner.lock();
        if inner.epoch != epoch {
            return;
        }
        inner.stats.frames_sent += 1;
        inner.last_activity = Some(Utc::now());
    }

    async fn run_writer(self: Arc<Self>, epoch: u64, mut sink: WireSink, outbox: Arc<Outbox>) {
        loop {
            let message = match outbox.peek().await {
                OutboxItem::Frame(pending) => WireMessage::Text(pending.payload),
                OutboxItem::Ping(frame) => WireMessage::Text(frame),
                OutboxItem::Close => {
                    let closing = async {
                        sink.send(WireMessage::Close(None)).await?;
                        sink.close().await
                    };
                    match timeout(CLOSE_GRACE, closing).await {
                        Ok(Ok(())) => debug!("Session {} sent close", self.session_id),
                        Ok(Err(e)) => debug!("Session {} close failed: {}", self.session_id, e),
                        Err(_) => debug!("Session {} close timed out", self.session_id),
                    }
                    return;
                }
            };

            if let Err(e) = sink.send(message).await {
                self.channel_lost(epoch, DisconnectReason::Transport(e.to_string()));
                return;
            }
            outbox.pop_sent();
            self.record_sent(epoch);
        }
    }

    async fn run_heartbeat(self: Arc<Self>, epoch: u64) {
        let period = self.config.ping_interval;
        let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let corr_id = {
                let mut inner = self.inner.lock();
                if inner.epoch != epoch {
                    return;
                }
                let corr_id = inner.keepalive.record_ping(self.clock.now());
                let frame = match build_ping(corr_id, Utc::now()) {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!("Session {} cannot encode ping: {}", self.session_id, e);
                        return;
                    }
                };
                let queued = inner
                    .channel
                    .as_ref()
                    .is_some_and(|channel| channel.outbox.push_ping(frame));
                if !queued {
                    return;
                }
                corr_id
            };

            tokio::time::sleep(self.config.pong_timeout).await;

            let verdict = {
                let mut inner = self.inner.lock();
                if inner.epoch != epoch {
                    return;
                }
                inner.keepalive.check(corr_id)
            };

            match verdict {
                HeartbeatVerdict::Answered => {}
                HeartbeatVerdict::Missed(missed) => {
                    warn!(
                        "Session {} missed heartbeat ({}/{})",
                        self.session_id, missed, self.config.max_missed_pongs
                    );
                }
                HeartbeatVerdict::Dead(missed) => {
                    self.channel_lost(epoch, DisconnectReason::HeartbeatTimeout { missed });
                    return;
                }
            }
        }
    }
}
