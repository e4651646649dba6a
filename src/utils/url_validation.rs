//! URL validation for agent endpoints
//!
//! Socket endpoints must use `ws` or `wss`; the agent API must use `http` or
//! `https`. Both need a host. Plaintext schemes are accepted but logged when the
//! host is not a loopback address.

use std::net::IpAddr;

use thiserror::Error;
use tracing::warn;
use url::Url;

/// Errors that can occur during URL validation
#[derive(Debug, Error)]
pub enum UrlValidationError {
    #[error("Invalid URL format: {0}")]
    InvalidFormat(#[from] url::ParseError),

    #[error("URL scheme must be one of {expected}, got: {actual}")]
    UnsupportedScheme {
        expected: &'static str,
        actual: String,
    },

    #[error("URL must have a host")]
    MissingHost,
}

/// Whether the URL host is `localhost` or a loopback IP.
pub fn is_loopback_host(parsed: &Url) -> bool {
    match parsed.host() {
        Some(url::Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(url::Host::Ipv4(ip)) => IpAddr::V4(ip).is_loopback(),
        Some(url::Host::Ipv6(ip)) => IpAddr::V6(ip).is_loopback(),
        None => false,
    }
}

fn validate_with_schemes(
    url: &str,
    secure: &'static str,
    plain: &'static str,
    expected: &'static str,
) -> Result<Url, UrlValidationError> {
    let parsed = Url::parse(url)?;

    let scheme = parsed.scheme();
    if scheme != secure && scheme != plain {
        return Err(UrlValidationError::UnsupportedScheme {
            expected,
            actual: scheme.to_string(),
        });
    }

    if parsed.host().is_none() {
        return Err(UrlValidationError::MissingHost);
    }

    if scheme == plain && !is_loopback_host(&parsed) {
        warn!(url = %parsed, "Unencrypted {} URL for remote host", plain);
    }

    Ok(parsed)
}

/// Validates an agent socket endpoint (`ws://` or `wss://`).
///
/// # Example
/// ```
/// use voicelink::utils::validate_socket_url;
///
/// assert!(validate_socket_url("wss://agent.example.com/ws").is_ok());
/// assert!(validate_socket_url("https://agent.example.com/ws").is_err());
/// ```
pub fn validate_socket_url(url: &str) -> Result<Url, UrlValidationError> {
    validate_with_schemes(url, "wss", "ws", "ws, wss")
}

/// Validates the agent API base URL (`http://` or `https://`).
pub fn validate_api_url(url: &str) -> Result<Url, UrlValidationError> {
    validate_with_schemes(url, "https", "http", "http, https")
}
