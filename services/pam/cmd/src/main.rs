//! PAM assistant client binary.
//!
//! Opens a session for one user, prints every assistant event to stdout,
//! and sends each line read from stdin as a chat message. Lines typed while
//! the channel is down are queued and delivered once it comes back.

use anyhow::Context;
use clap::Parser;
use pam_session::{
    ConnectionState, Credential, Session, SessionError, StateSnapshot, StaticTokenProvider,
};
use pam_wire::{Command, EventType, InboundEvent};
use std::io::Write;
use std::{path::PathBuf, sync::Arc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::ClientConfig;
use logging::PamLogFormatter;

/// Interactive client for the PAM assistant channel
#[derive(Parser, Debug)]
#[command(name = "pam-connect", version, about = "Interactive client for the PAM assistant channel")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// WebSocket base URL, e.g. wss://api.example.com
    #[arg(long)]
    base_url: Option<String>,

    /// User the session belongs to
    #[arg(long)]
    user_id: Option<String>,

    /// Session id to resume
    #[arg(long)]
    session_id: Option<String>,

    /// Bearer token
    #[arg(long)]
    token: Option<String>,

    /// Path between the base URL and the user id
    #[arg(long)]
    session_path: Option<String>,

    /// Heartbeat interval, e.g. 20s
    #[arg(long)]
    ping_interval: Option<humantime::Duration>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn apply_to(&self, config: &mut ClientConfig) {
        if let Some(base_url) = &self.base_url {
            config.base_url = base_url.clone();
        }
        if let Some(user_id) = &self.user_id {
            config.user_id = Some(user_id.clone());
        }
        if let Some(session_id) = &self.session_id {
            config.session_id = Some(session_id.clone());
        }
        if let Some(token) = &self.token {
            config.token = Some(token.clone());
        }
        if let Some(session_path) = &self.session_path {
            config.session_path = session_path.clone();
        }
        if let Some(interval) = self.ping_interval {
            config.ping_interval = interval.into();
        }
    }
}

fn print_event(event: &InboundEvent) {
    match (event.event_type, event.text()) {
        (EventType::ChatDelta, Some(text)) => {
            print!("{}", text);
            let _ = std::io::stdout().flush();
        }
        (EventType::ChatComplete, Some(text)) => println!("\n{}", text),
        (EventType::ChatComplete, None) => println!(),
        (EventType::Error, _) => {
            component_warn!("server", "Assistant reported an error: {}", event.payload)
        }
        (event_type, _) => println!("[{}] {}", event_type, event.payload),
    }
}

fn log_state(snapshot: &StateSnapshot) {
    let detail = snapshot.detail.as_deref().unwrap_or("");
    match snapshot.state {
        ConnectionState::Error => {
            component_error!("session", "Session stopped: {}", detail)
        }
        ConnectionState::Reconnecting => {
            component_warn!("session", "Connection lost: {}", detail)
        }
        state => component_info!("session", "State: {}", state),
    }
}

fn log_error(error: &SessionError) {
    component_error!("session", "{}", error);
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"))
        .add_directive(format!("pam_connect={}", args.log_level).parse()?)
        .add_directive(format!("pam_session={}", args.log_level).parse()?)
        .add_directive(format!("pam_storage={}", args.log_level).parse()?)
        .add_directive(format!("pam_wire={}", args.log_level).parse()?);

    // stdout carries assistant output; logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .event_format(PamLogFormatter::new("pam"))
        .init();

    info!("Starting PAM client v{}", env!("CARGO_PKG_VERSION"));

    let mut config = ClientConfig::load_from_file(&args.config)?;
    args.apply_to(&mut config);

    let user_id = config
        .user_id
        .clone()
        .context("no user id; pass --user-id or set PAM_USER_ID")?;
    let token = config
        .token
        .clone()
        .context("no token; pass --token or set PAM_TOKEN")?;

    let tokens = Arc::new(StaticTokenProvider::new(Credential::new(token)));
    let mut builder = Session::builder(config.session_config(), user_id, tokens);
    if let Some(session_id) = config.session_id.clone() {
        builder = builder.session_id(session_id);
    }
    let session = builder.build()?;

    let _events = session.on_event(print_event);
    let _states = session.on_state_change(log_state);
    let _errors = session.on_error(log_error);

    component_info!(
        "cli",
        "Session {} for user {}",
        session.session_id(),
        session.user_id()
    );
    session.open();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    component_info!("cli", "End of input");
                    break;
                };
                let text = line.trim();
                if text.is_empty() {
                    continue;
                }
                match session.send(Command::chat(text)) {
                    Ok(id) => component_debug!(
                        "cli",
                        "Queued {} ({} pending)",
                        id,
                        session.pending_count()
                    ),
                    Err(e) => component_warn!("cli", "Message not sent: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                component_info!("cli", "Interrupted");
                break;
            }
        }
    }

    let stats = session.stats();
    info!(
        "Closing session: {} sent, {} received, {} duplicates dropped, {} connects",
        stats.frames_sent, stats.frames_received, stats.duplicates_dropped, stats.connects
    );
    session.close();

    Ok(())
}
