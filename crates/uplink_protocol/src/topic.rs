//! Hierarchical topics for push-style transports.
//!
//! Layout:
//!
//! ```text
//! {account}/f/{group}.{feed}        feed value (plain text payload)
//! {account}/f/{group}.{feed}/json   feed value wrapped in a JSON envelope
//! {account}/f/{group}.{feed}/get    request for the current value
//! {account}/g/{group}               whole group
//! {account}/throttle                rate-limit notices
//! {account}/errors                  service error notices
//! time/seconds                      wall-clock broadcast
//! ```

use crate::error::{ProtocolError, ProtocolResult};
use crate::feed::{validate_key, FeedName};
use std::fmt;

/// Payload encoding carried by a feed topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicFormat {
    /// Raw value.
    Plain,
    /// JSON [`FeedEnvelope`](crate::FeedEnvelope).
    Json,
}

/// A parsed pub/sub topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Feed value topic.
    Feed {
        /// Owning account.
        account: String,
        /// Qualified feed.
        name: FeedName,
        /// Payload encoding.
        format: TopicFormat,
    },
    /// Request for the current value of a feed.
    FeedGet {
        /// Owning account.
        account: String,
        /// Qualified feed.
        name: FeedName,
    },
    /// Group topic.
    Group {
        /// Owning account.
        account: String,
        /// Group key.
        group: String,
    },
    /// Rate-limit notices for an account.
    Throttle {
        /// Owning account.
        account: String,
    },
    /// Error notices for an account.
    Errors {
        /// Owning account.
        account: String,
    },
    /// Wall-clock seconds broadcast.
    Time,
}

impl Topic {
    /// Plain feed topic.
    pub fn feed(account: impl Into<String>, name: FeedName) -> Self {
        Topic::Feed {
            account: account.into(),
            name,
            format: TopicFormat::Plain,
        }
    }

    /// JSON feed topic.
    pub fn feed_json(account: impl Into<String>, name: FeedName) -> Self {
        Topic::Feed {
            account: account.into(),
            name,
            format: TopicFormat::Json,
        }
    }

    /// Current-value request topic.
    pub fn feed_get(account: impl Into<String>, name: FeedName) -> Self {
        Topic::FeedGet {
            account: account.into(),
            name,
        }
    }

    /// Parses a topic string.
    pub fn parse(topic: &str) -> ProtocolResult<Self> {
        let invalid = || ProtocolError::InvalidTopic(topic.to_string());
        if topic == "time/seconds" {
            return Ok(Topic::Time);
        }

        let parts: Vec<&str> = topic.split('/').collect();
        match parts.as_slice() {
            [account, "throttle"] => Ok(Topic::Throttle {
                account: account.to_string(),
            }),
            [account, "errors"] => Ok(Topic::Errors {
                account: account.to_string(),
            }),
            [account, "g", group] => {
                validate_key(group)?;
                Ok(Topic::Group {
                    account: account.to_string(),
                    group: group.to_string(),
                })
            }
            [account, "f", name] => Ok(Topic::feed(*account, FeedName::parse(name)?)),
            [account, "f", name, "json"] => Ok(Topic::feed_json(*account, FeedName::parse(name)?)),
            [account, "f", name, "get"] => Ok(Topic::feed_get(*account, FeedName::parse(name)?)),
            _ => Err(invalid()),
        }
    }

    /// Returns the feed this topic addresses, if any.
    pub fn feed_name(&self) -> Option<&FeedName> {
        match self {
            Topic::Feed { name, .. } | Topic::FeedGet { name, .. } => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Feed {
                account,
                name,
                format: TopicFormat::Plain,
            } => write!(f, "{account}/f/{name}"),
            Topic::Feed {
                account,
                name,
                format: TopicFormat::Json,
            } => write!(f, "{account}/f/{name}/json"),
            Topic::FeedGet { account, name } => write!(f, "{account}/f/{name}/get"),
            Topic::Group { account, group } => write!(f, "{account}/g/{group}"),
            Topic::Throttle { account } => write!(f, "{account}/throttle"),
            Topic::Errors { account } => write!(f, "{account}/errors"),
            Topic::Time => f.write_str("time/seconds"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::FeedKey;

    fn name(key: &str) -> FeedName {
        FeedName::new("garden", FeedKey::new(key).unwrap())
    }

    #[test]
    fn renders_hierarchical_layout() {
        assert_eq!(Topic::feed("alice", name("temp")).to_string(), "alice/f/garden.temp");
        assert_eq!(
            Topic::feed_json("alice", name("temp")).to_string(),
            "alice/f/garden.temp/json"
        );
        assert_eq!(
            Topic::feed_get("alice", name("temp")).to_string(),
            "alice/f/garden.temp/get"
        );
        assert_eq!(Topic::Time.to_string(), "time/seconds");
    }

    #[test]
    fn parse_inverts_display() {
        let topics = [
            Topic::feed("alice", name("temp")),
            Topic::feed_json("alice", name("temp")),
            Topic::feed_get("alice", name("temp")),
            Topic::Group {
                account: "alice".into(),
                group: "garden".into(),
            },
            Topic::Throttle {
                account: "alice".into(),
            },
            Topic::Errors {
                account: "alice".into(),
            },
            Topic::Time,
        ];
        for topic in topics {
            assert_eq!(Topic::parse(&topic.to_string()).unwrap(), topic);
        }
    }

    #[test]
    fn rejects_unknown_layouts() {
        assert!(Topic::parse("alice").is_err());
        assert!(Topic::parse("alice/x/garden.temp").is_err());
        assert!(Topic::parse("alice/f/nodot").is_err());
    }
}
