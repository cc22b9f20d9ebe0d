//! Remote update timestamps.

use crate::error::{ProtocolError, ProtocolResult};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The time at which the remote service last updated a feed.
///
/// Timestamps are totally ordered; the engine only ever replaces a cached
/// timestamp with a strictly greater one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RemoteTimestamp(DateTime<Utc>);

impl RemoteTimestamp {
    /// Parses an RFC 3339 timestamp such as `2024-03-01T12:00:05Z`.
    pub fn parse(text: &str) -> ProtocolResult<Self> {
        DateTime::parse_from_rfc3339(text)
            .map(|dt| Self(dt.with_timezone(&Utc)))
            .map_err(|_| ProtocolError::InvalidTimestamp(text.to_string()))
    }

    /// Creates a timestamp from Unix seconds.
    pub fn from_unix(secs: i64) -> ProtocolResult<Self> {
        Utc.timestamp_opt(secs, 0)
            .single()
            .map(Self)
            .ok_or_else(|| ProtocolError::InvalidTimestamp(secs.to_string()))
    }

    /// Creates a timestamp from Unix milliseconds.
    pub fn from_unix_millis(millis: i64) -> ProtocolResult<Self> {
        Utc.timestamp_millis_opt(millis)
            .single()
            .map(Self)
            .ok_or_else(|| ProtocolError::InvalidTimestamp(millis.to_string()))
    }

    /// Returns the current wall-clock time.
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Returns Unix seconds.
    pub fn unix(&self) -> i64 {
        self.0.timestamp()
    }

    /// Returns Unix milliseconds.
    pub fn unix_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// Returns the smallest timestamp strictly after `self` at millisecond
    /// resolution.
    pub fn next_millisecond(&self) -> Self {
        Self(self.0 + chrono::Duration::milliseconds(1))
    }
}

impl fmt::Display for RemoteTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.to_rfc3339_opts(SecondsFormat::AutoSi, true))
    }
}

impl TryFrom<String> for RemoteTimestamp {
    type Error = ProtocolError;

    fn try_from(value: String) -> ProtocolResult<Self> {
        Self::parse(&value)
    }
}

impl From<RemoteTimestamp> for String {
    fn from(ts: RemoteTimestamp) -> Self {
        ts.to_string()
    }
}
