//! HTTP Basic authentication for the `AUTH_REQUIRED` access outcome
//! (spec §4.8: "the supported scheme is Basic ... pluggable with a
//! look-up table backend for credential validation").

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::collections::HashMap;

use crate::error::IcapError;

/// Parses a `Proxy-Authorization: Basic <base64>` / `Authorization:
/// Basic <base64>` header value into `(username, password)`.
pub fn parse_basic_credentials(header_value: &str) -> Result<(String, String), IcapError> {
    let encoded = header_value
        .trim()
        .strip_prefix("Basic ")
        .or_else(|| header_value.trim().strip_prefix("basic "))
        .ok_or_else(|| IcapError::protocol("expected a Basic auth challenge response", "auth"))?;
    let decoded = BASE64
        .decode(encoded.trim())
        .map_err(|_| IcapError::protocol("Basic credentials are not valid base64", "auth"))?;
    let text = String::from_utf8(decoded).map_err(|_| IcapError::protocol("Basic credentials are not valid UTF-8", "auth"))?;
    let (user, pass) = text
        .split_once(':')
        .ok_or_else(|| IcapError::protocol("Basic credentials missing ':' separator", "auth"))?;
    Ok((user.to_string(), pass.to_string()))
}

/// Builds the `Proxy-Authenticate: Basic realm="..."` challenge value
/// (spec §4.8, S6).
pub fn challenge_header(realm: &str) -> String {
    format!("Basic realm=\"{realm}\"")
}

/// Pluggable credential backend; the built-in implementation is a
/// static in-memory table, matching the spec's "look-up table backend"
/// wording. Other backends can implement the same trait.
pub trait CredentialStore: Send + Sync {
    fn verify(&self, username: &str, password: &str) -> bool;
}

#[derive(Debug, Clone, Default)]
pub struct StaticCredentialStore {
    users: HashMap<String, String>,
}

impl StaticCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, username: impl Into<String>, password: impl Into<String>) {
        self.users.insert(username.into(), password.into());
    }
}

impl CredentialStore for StaticCredentialStore {
    fn verify(&self, username: &str, password: &str) -> bool {
        self.users.get(username).map(|p| p == password).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_basic_header() {
        // "alice:wonderland" base64-encoded
        let value = "Basic YWxpY2U6d29uZGVybGFuZA==";
        let (user, pass) = parse_basic_credentials(value).unwrap();
        assert_eq!(user, "alice");
        assert_eq!(pass, "wonderland");
    }

    #[test]
    fn rejects_non_basic_scheme() {
        assert!(parse_basic_credentials("Digest abc").is_err());
    }

    #[test]
    fn static_store_verifies_known_users_only() {
        let mut store = StaticCredentialStore::new();
        store.add("alice", "wonderland");
        assert!(store.verify("alice", "wonderland"));
        assert!(!store.verify("alice", "wrong"));
        assert!(!store.verify("bob", "anything"));
    }
}
