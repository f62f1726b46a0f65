//! Credentials and the token provider interface.
//!
//! Token issuance belongs to the auth system; the session only asks for the
//! current credential and, when it is about to expire or was rejected, for a
//! refreshed one.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Bearer credential with an optional expiry
#[derive(Clone, PartialEq)]
pub struct Credential {
    /// Raw token placed in the endpoint URL
    pub token: String,
    /// When the token stops being valid, if known
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    /// Wrap a token, reading the expiry from its `exp` claim if it is a JWT
    pub fn new(token: impl Into<String>) -> Self {
        let token = token.into();
        let expires_at = jwt_expiry(&token);
        Self { token, expires_at }
    }

    /// Wrap a token with an explicit expiry
    pub fn with_expiry(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expires_at: Some(expires_at),
        }
    }

    /// Whether the token expires within `threshold` of `now` (or already has)
    pub fn expires_within(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => match (expires_at - now).to_std() {
                Ok(remaining) => remaining <= threshold,
                Err(_) => true,
            },
            None => false,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"***")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Deserialize)]
struct Claims {
    exp: Option<i64>,
}

fn jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    let mut parts = token.split('.');
    let (_header, payload, _signature) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    let raw = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Claims = serde_json::from_slice(&raw).ok()?;
    DateTime::from_timestamp(claims.exp?, 0)
}

/// Token provider errors
#[derive(Error, Debug, Clone)]
pub enum AuthError {
    /// No credential could be supplied
    #[error("no credential available: {0}")]
    Unavailable(String),
    /// The refresh call failed
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),
}

/// Supplies credentials to the session
///
/// Implementations may be shared by several sessions and are expected to
/// coalesce concurrent refreshes themselves.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// The credential to use right now
    async fn current_token(&self) -> Result<Credential, AuthError>;

    /// Obtain a fresh credential
    async fn refresh_token(&self) -> Result<Credential, AuthError>;
}

/// Provider holding a fixed credential that can be swapped at runtime
///
/// It cannot mint tokens, so a refresh hands back whatever is currently set.
#[derive(Debug)]
pub struct StaticTokenProvider {
    credential: RwLock<Option<Credential>>,
}

impl StaticTokenProvider {
    /// Provider with a credential
    pub fn new(credential: Credential) -> Self {
        Self {
            credential: RwLock::new(Some(credential)),
        }
    }

    /// Provider with no credential; every call fails until one is set
    pub fn empty() -> Self {
        Self {
            credential: RwLock::new(None),
        }
    }

    /// Replace the credential
    pub fn set(&self, credential: Credential) {
        *self.credential.write() = Some(credential);
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn current_token(&self) -> Result<Credential, AuthError> {
        self.credential
            .read()
            .clone()
            .ok_or_else(|| AuthError::Unavailable("no token configured".to_string()))
    }

    async fn refresh_token(&self) -> Result<Credential, AuthError> {
        self.credential
            .read()
            .clone()
            .ok_or_else(|| AuthError::RefreshFailed("no token configured".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jwt_with_exp(exp: i64) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"user-42","exp":{}}}"#, exp));
        format!("{}.{}.signature", header, payload)
    }

    #[test]
    fn test_jwt_expiry_is_decoded() {
        let credential = Credential::new(jwt_with_exp(1_900_000_000));
        assert_eq!(
            credential.expires_at,
            DateTime::from_timestamp(1_900_000_000, 0)
        );
    }

    #[test]
    fn test_opaque_token_has_no_expiry() {
        assert!(Credential::new("plain-token").expires_at.is_none());
        assert!(Credential::new("a.b.c.d").expires_at.is_none());
        assert!(Credential::new("a.!!!.c").expires_at.is_none());
    }

    #[test]
    fn test_expires_within_threshold() {
        let now = Utc::now();
        let soon = Credential::with_expiry("t", now + chrono::Duration::minutes(2));
        let later = Credential::with_expiry("t", now + chrono::Duration::hours(2));
        let expired = Credential::with_expiry("t", now - chrono::Duration::minutes(1));
        let threshold = Duration::from_secs(300);

        assert!(soon.expires_within(threshold, now));
        assert!(!later.expires_within(threshold, now));
        assert!(expired.expires_within(threshold, now));
        assert!(!Credential::new("opaque").expires_within(threshold, now));
    }

    #[test]
    fn test_debug_redacts_token() {
        let rendered = format!("{:?}", Credential::new("secret-value"));
        assert!(!rendered.contains("secret-value"));
    }

    #[tokio::test]
    async fn test_static_provider() {
        let provider = StaticTokenProvider::empty();
        assert!(provider.current_token().await.is_err());
        assert!(provider.refresh_token().await.is_err());

        provider.set(Credential::new("t-1"));
        assert_eq!(provider.current_token().await.unwrap().token, "t-1");
        assert_eq!(provider.refresh_token().await.unwrap().token, "t-1");
    }
}
