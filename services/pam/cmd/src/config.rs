//! Configuration handling for the PAM client.
//!
//! Settings come from the `services.pam` section of a YAML file, then
//! `PAM_*` environment variables, then command-line flags. A missing or
//! unreadable file is not an error; the defaults are used instead.

use anyhow::Result;
use pam_session::{default_delays, SessionConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// PAM client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// WebSocket base URL
    pub base_url: String,
    /// Path between the base URL and the user id
    pub session_path: String,
    /// User the session belongs to
    pub user_id: Option<String>,
    /// Session id to resume; generated when absent
    pub session_id: Option<String>,
    /// Bearer token
    pub token: Option<String>,
    /// Heartbeat interval
    #[serde(with = "humantime_serde")]
    pub ping_interval: Duration,
    /// Heartbeat answer timeout
    #[serde(with = "humantime_serde")]
    pub pong_timeout: Duration,
    /// Consecutive missed pongs before reconnecting
    pub max_missed_pongs: u32,
    /// Reconnect backoff table
    pub reconnect_delays: Vec<humantime_serde::Serde<Duration>>,
    /// Reconnect budget; `null` retries forever
    pub max_reconnect_attempts: Option<u32>,
    /// Refresh the token when it expires within this window
    #[serde(with = "humantime_serde")]
    pub token_refresh_threshold: Duration,
    /// Limit on a single connection attempt
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Inbound dedup window
    #[serde(with = "humantime_serde")]
    pub dedup_window: Duration,
    /// Offline queue capacity
    pub queue_capacity: usize,
    /// Offline queue age limit
    #[serde(with = "humantime_serde")]
    pub queue_max_age: Option<Duration>,
    /// Keep the offline queue after a terminal error
    pub retain_queue_on_error: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let session = SessionConfig::default();
        Self {
            base_url: session.base_url,
            session_path: session.session_path,
            user_id: None,
            session_id: None,
            token: None,
            ping_interval: session.ping_interval,
            pong_timeout: session.pong_timeout,
            max_missed_pongs: session.max_missed_pongs,
            reconnect_delays: default_delays().into_iter().map(Into::into).collect(),
            max_reconnect_attempts: session.max_reconnect_attempts,
            token_refresh_threshold: session.token_refresh_threshold,
            connect_timeout: session.connect_timeout,
            dedup_window: session.dedup_window,
            queue_capacity: session.queue_capacity,
            queue_max_age: session.queue_max_age,
            retain_queue_on_error: session.retain_queue_on_error,
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    services: Option<ServicesConfig>,
}

#[derive(Debug, Deserialize)]
struct ServicesConfig {
    pam: Option<ClientConfig>,
}

impl ClientConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root) => {
                    info!("Loaded configuration from {:?}", path);
                    root.services.and_then(|s| s.pam).unwrap_or_default()
                }
                Err(e) => {
                    warn!("Failed to parse config file {:?} ({}), using defaults", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_environment_overrides();

        info!(
            "PAM configuration: base_url={}, session_path={}, ping_interval={:?}",
            config.base_url, config.session_path, config.ping_interval
        );
        Ok(config)
    }

    /// Apply `PAM_*` environment variable overrides
    fn apply_environment_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(base_url) = lookup("PAM_BASE_URL") {
            info!("Base URL overridden by environment: {}", base_url);
            self.base_url = base_url;
        }

        if let Some(user_id) = lookup("PAM_USER_ID") {
            info!("User id overridden by environment: {}", user_id);
            self.user_id = Some(user_id);
        }

        if let Some(token) = lookup("PAM_TOKEN") {
            info!("Token overridden by environment");
            self.token = Some(token);
        }

        if let Some(session_path) = lookup("PAM_SESSION_PATH") {
            info!("Session path overridden by environment: {}", session_path);
            self.session_path = session_path;
        }

        if let Some(raw) = lookup("PAM_PING_INTERVAL") {
            match humantime::parse_duration(&raw) {
                Ok(interval) => {
                    info!("Ping interval overridden by environment: {:?}", interval);
                    self.ping_interval = interval;
                }
                Err(e) => warn!("Ignoring PAM_PING_INTERVAL={:?}: {}", raw, e),
            }
        }
    }

    /// Session settings derived from this configuration
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            base_url: self.base_url.clone(),
            session_path: self.session_path.clone(),
            ping_interval: self.ping_interval,
            pong_timeout: self.pong_timeout,
            max_missed_pongs: self.max_missed_pongs,
            reconnect_delays: self
                .reconnect_delays
                .iter()
                .map(|delay| delay.into_inner())
                .collect(),
            max_reconnect_attempts: self.max_reconnect_attempts,
            token_refresh_threshold: self.token_refresh_threshold,
            connect_timeout: self.connect_timeout,
            dedup_window: self.dedup_window,
            queue_capacity: self.queue_capacity,
            queue_max_age: self.queue_max_age,
            retain_queue_on_error: self.retain_queue_on_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.base_url, "ws://localhost:8000");
        assert_eq!(config.session_path, "api/v1/pam/ws");
        assert_eq!(config.ping_interval, Duration::from_secs(20));
        assert_eq!(config.max_reconnect_attempts, Some(10));
        assert!(config.user_id.is_none());

        let session = config.session_config();
        assert_eq!(session.reconnect_delays, default_delays());
        assert_eq!(session.queue_capacity, 256);
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
services:
  pam:
    base_url: wss://api.wheelsandwins.test
    user_id: user-42
    ping_interval: 15s
    pong_timeout: 5s
    reconnect_delays: [500ms, 1s, 3s]
    max_reconnect_attempts: null
    queue_max_age: 2m
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = ClientConfig::load_from_file(temp_file.path()).unwrap();
        assert_eq!(config.base_url, "wss://api.wheelsandwins.test");
        assert_eq!(config.user_id.as_deref(), Some("user-42"));
        assert_eq!(config.ping_interval, Duration::from_secs(15));
        assert_eq!(config.pong_timeout, Duration::from_secs(5));
        assert_eq!(config.max_reconnect_attempts, None);
        assert_eq!(config.queue_max_age, Some(Duration::from_secs(120)));
        // untouched keys keep their defaults
        assert_eq!(config.session_path, "api/v1/pam/ws");
        assert_eq!(config.queue_capacity, 256);

        let session = config.session_config();
        assert_eq!(
            session.reconnect_delays,
            vec![
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(3)
            ]
        );
    }

    #[test]
    fn test_missing_or_invalid_file_uses_defaults() {
        let config = ClientConfig::load_from_file("/nonexistent/pam.yaml").unwrap();
        assert_eq!(config.session_path, ClientConfig::default().session_path);

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"services: [not, a, map").unwrap();
        let config = ClientConfig::load_from_file(temp_file.path()).unwrap();
        assert_eq!(config.queue_capacity, 256);
    }

    #[test]
    fn test_environment_overrides() {
        let env: HashMap<&str, &str> = [
            ("PAM_BASE_URL", "wss://staging.test"),
            ("PAM_USER_ID", "user-7"),
            ("PAM_TOKEN", "t0ken"),
            ("PAM_SESSION_PATH", "ws/v2"),
            ("PAM_PING_INTERVAL", "30s"),
        ]
        .into_iter()
        .collect();

        let mut config = ClientConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.base_url, "wss://staging.test");
        assert_eq!(config.user_id.as_deref(), Some("user-7"));
        assert_eq!(config.token.as_deref(), Some("t0ken"));
        assert_eq!(config.session_path, "ws/v2");
        assert_eq!(config.ping_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_bad_ping_interval_override_ignored() {
        let mut config = ClientConfig::default();
        config.apply_overrides(|key| (key == "PAM_PING_INTERVAL").then(|| "soon".to_string()));
        assert_eq!(config.ping_interval, Duration::from_secs(20));
    }
}
