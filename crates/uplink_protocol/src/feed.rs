//! Feed identifiers.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum length of a feed or group key.
pub const MAX_KEY_LEN: usize = 128;

/// A validated feed key.
///
/// Keys are restricted to ASCII letters, digits and `-`, which keeps them safe
/// to embed in both REST paths and pub/sub topics. Ordering is lexicographic,
/// which is the order feeds are published in.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FeedKey(String);

impl FeedKey {
    /// Validates and wraps a feed key.
    pub fn new(key: impl Into<String>) -> ProtocolResult<Self> {
        let key = key.into();
        validate_key(&key)?;
        Ok(Self(key))
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FeedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for FeedKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for FeedKey {
    type Error = ProtocolError;

    fn try_from(value: String) -> ProtocolResult<Self> {
        Self::new(value)
    }
}

impl TryFrom<&str> for FeedKey {
    type Error = ProtocolError;

    fn try_from(value: &str) -> ProtocolResult<Self> {
        Self::new(value)
    }
}

impl From<FeedKey> for String {
    fn from(key: FeedKey) -> Self {
        key.0
    }
}

/// Checks a feed or group key.
pub fn validate_key(key: &str) -> ProtocolResult<()> {
    let reject = |reason| {
        Err(ProtocolError::InvalidFeedKey {
            key: key.to_string(),
            reason,
        })
    };

    if key.is_empty() {
        return reject("empty");
    }
    if key.len() > MAX_KEY_LEN {
        return reject("longer than 128 characters");
    }
    if !key.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
        return reject("only letters, digits and '-' are allowed");
    }
    Ok(())
}

/// A feed qualified by its group, rendered as `group.key`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FeedName {
    /// Group the feed belongs to.
    pub group: String,
    /// Feed key within the group.
    pub key: FeedKey,
}

impl FeedName {
    /// Creates a qualified feed name.
    pub fn new(group: impl Into<String>, key: FeedKey) -> Self {
        Self {
            group: group.into(),
            key,
        }
    }

    /// Parses `group.key`.
    pub fn parse(full: &str) -> ProtocolResult<Self> {
        let (group, key) = full
            .split_once('.')
            .ok_or_else(|| ProtocolError::InvalidTopic(full.to_string()))?;
        validate_key(group)?;
        Ok(Self::new(group, FeedKey::new(key)?))
    }
}

impl fmt::Display for FeedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.key)
    }
}

/// Account credentials presented to the remote service.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Account (user) name.
    pub username: String,
    /// API key.
    pub key: String,
}

impl Credentials {
    /// Creates a credentials pair.
    pub fn new(username: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            key: key.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("key", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn accepts_plain_keys() {
        assert!(FeedKey::new("temperature").is_ok());
        assert!(FeedKey::new("ph-sensor-2").is_ok());
    }

    #[test]
    fn rejects_bad_keys() {
        assert!(FeedKey::new("").is_err());
        assert!(FeedKey::new("has space").is_err());
        assert!(FeedKey::new("dotted.key").is_err());
        assert!(FeedKey::new("a".repeat(MAX_KEY_LEN + 1)).is_err());
    }

    #[test]
    fn feed_name_round_trip() {
        let name = FeedName::new("garden", FeedKey::new("soil").unwrap());
        assert_eq!(name.to_string(), "garden.soil");
        assert_eq!(FeedName::parse("garden.soil").unwrap(), name);
        assert!(FeedName::parse("nodot").is_err());
    }

    #[test]
    fn credentials_debug_hides_key() {
        let creds = Credentials::new("alice", "aio_secret");
        let shown = format!("{creds:?}");
        assert!(shown.contains("alice"));
        assert!(!shown.contains("aio_secret"));
    }

    #[test]
    fn keys_order_lexicographically() {
        let mut keys: Vec<FeedKey> = ["ph", "battery", "temp"]
            .iter()
            .map(|k| FeedKey::new(*k).unwrap())
            .collect();
        keys.sort();
        let order: Vec<&str> = keys.iter().map(FeedKey::as_str).collect();
        assert_eq!(order, vec!["battery", "ph", "temp"]);
    }

    proptest! {
        #[test]
        fn valid_alphabet_always_accepted(key in "[A-Za-z0-9-]{1,128}") {
            prop_assert!(FeedKey::new(key).is_ok());
        }
    }
}
