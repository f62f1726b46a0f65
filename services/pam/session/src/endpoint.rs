//! Endpoint URL construction for the PAM channel.
//!
//! The channel is addressed as `{base_url}/{session_path}/{user_id}?token=…`.

use crate::transport::TransportError;
use url::Url;

/// Build the endpoint URL for one connection attempt
pub fn build_endpoint(
    base_url: &str,
    session_path: &str,
    user_id: &str,
    token: &str,
) -> Result<Url, TransportError> {
    if user_id.trim().is_empty() {
        return Err(TransportError::InvalidEndpoint("empty user id".to_string()));
    }

    let mut url = Url::parse(base_url)
        .map_err(|e| TransportError::InvalidEndpoint(format!("{}: {}", base_url, e)))?;

    {
        let mut segments = url.path_segments_mut().map_err(|_| {
            TransportError::InvalidEndpoint(format!("{} cannot carry a path", base_url))
        })?;
        segments.pop_if_empty();
        for part in session_path.split('/').filter(|p| !p.is_empty()) {
            segments.push(part);
        }
        segments.push(user_id);
    }

    url.query_pairs_mut().append_pair("token", token);
    Ok(url)
}

/// Render a URL for logs with the token value masked
pub fn redact(url: &Url) -> String {
    let mut masked = url.clone();
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            let value = if k == "token" { "***".to_string() } else { v.into_owned() };
            (k.into_owned(), value)
        })
        .collect();

    if pairs.is_empty() {
        return masked.to_string();
    }

    masked.query_pairs_mut().clear().extend_pairs(pairs);
    masked.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_endpoint() {
        let url = build_endpoint("wss://api.example.com", "api/v1/pam/ws", "user-42", "abc").unwrap();
        assert_eq!(url.as_str(), "wss://api.example.com/api/v1/pam/ws/user-42?token=abc");
    }

    #[test]
    fn test_build_endpoint_normalizes_slashes() {
        let url = build_endpoint("ws://localhost:8000/", "/api/v1/pam/ws/", "u1", "t").unwrap();
        assert_eq!(url.as_str(), "ws://localhost:8000/api/v1/pam/ws/u1?token=t");
    }

    #[test]
    fn test_build_endpoint_escapes_values() {
        let url = build_endpoint("ws://localhost", "ws", "a b", "x&y=z").unwrap();
        assert_eq!(url.path(), "/ws/a%20b");
        let token: Vec<_> = url.query_pairs().filter(|(k, _)| k == "token").collect();
        assert_eq!(token[0].1, "x&y=z");
    }

    #[test]
    fn test_build_endpoint_rejects_bad_input() {
        assert!(matches!(
            build_endpoint("not a url", "ws", "u", "t"),
            Err(TransportError::InvalidEndpoint(_))
        ));
        assert!(matches!(
            build_endpoint("ws://localhost", "ws", " ", "t"),
            Err(TransportError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn test_redact_masks_token() {
        let url = build_endpoint("ws://localhost", "ws", "u", "secret").unwrap();
        let shown = redact(&url);
        assert!(!shown.contains("secret"));
        assert!(shown.contains("token=***") || shown.contains("token=%2A%2A%2A"));
    }
}
