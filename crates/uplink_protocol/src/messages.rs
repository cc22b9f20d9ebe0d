//! Wire documents exchanged with the telemetry service.
//!
//! The polling transport speaks JSON over an HTTP-style request/response
//! channel; the push transport carries the same [`FeedEnvelope`] on its
//! `/json` topics.

use crate::error::ProtocolResult;
use crate::feed::FeedName;
use crate::timestamp::RemoteTimestamp;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Header carrying the account API key.
pub const API_KEY_HEADER: &str = "X-AIO-Key";

/// Path of the wall-clock resource.
pub const TIME_PATH: &str = "/api/v2/time/seconds";

/// HTTP request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    /// GET.
    Get,
    /// POST.
    Post,
    /// DELETE.
    Delete,
}

/// A request on the polling channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Method.
    pub method: HttpMethod,
    /// Absolute path, e.g. `/api/v2/alice/feeds/garden.temp`.
    pub path: String,
    /// Header pairs.
    pub headers: Vec<(String, String)>,
    /// JSON body.
    pub body: Option<String>,
}

impl HttpRequest {
    /// Creates a GET request.
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            path: path.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// Creates a POST request with a JSON body.
    pub fn post<T: Serialize>(path: impl Into<String>, body: &T) -> ProtocolResult<Self> {
        Ok(Self {
            method: HttpMethod::Post,
            path: path.into(),
            headers: Vec::new(),
            body: Some(serde_json::to_string(body)?),
        })
    }

    /// Adds a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Looks up a header, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A response on the polling channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Response body.
    pub body: String,
}

impl HttpResponse {
    /// Creates a response.
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Creates a 200 response with a JSON body.
    pub fn json<T: Serialize>(body: &T) -> ProtocolResult<Self> {
        Ok(Self::new(200, serde_json::to_string(body)?))
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Decodes the JSON body.
    pub fn decode<T: DeserializeOwned>(&self) -> ProtocolResult<T> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// REST path of a feed resource.
pub fn feed_path(account: &str, name: &FeedName) -> String {
    format!("/api/v2/{account}/feeds/{name}")
}

/// REST path for appending data to a feed.
pub fn feed_data_path(account: &str, name: &FeedName) -> String {
    format!("/api/v2/{account}/feeds/{name}/data")
}

/// REST path of a group resource.
pub fn group_path(account: &str, group: &str) -> String {
    format!("/api/v2/{account}/groups/{group}")
}

/// REST path for creating feeds inside a group.
pub fn group_feeds_path(account: &str, group: &str) -> String {
    format!("/api/v2/{account}/groups/{group}/feeds")
}

/// REST path for creating groups.
pub fn groups_path(account: &str) -> String {
    format!("/api/v2/{account}/groups")
}

/// A feed as returned by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedDocument {
    /// Fully qualified key, `group.key`.
    pub key: String,
    /// Most recent value, absent for a feed that never received data.
    #[serde(default)]
    pub last_value: Option<String>,
    /// When the feed was last written.
    #[serde(default)]
    pub updated_at: Option<RemoteTimestamp>,
}

/// A group as returned by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDocument {
    /// Group key.
    pub key: String,
    /// Feeds in the group.
    #[serde(default)]
    pub feeds: Vec<FeedDocument>,
}

/// Body of a data POST.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPoint {
    /// Value to append.
    pub value: String,
    /// Free-form metadata, e.g. a location string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
}

impl DataPoint {
    /// Creates a data point.
    pub fn new(value: impl Into<String>, metadata: Option<&str>) -> Self {
        Self {
            value: value.into(),
            metadata: metadata.map(str::to_string),
        }
    }
}

/// Body of a feed creation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewFeed {
    /// The feed to create.
    pub feed: NewFeedBody,
}

/// Inner body of [`NewFeed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewFeedBody {
    /// Feed key within the group.
    pub key: String,
}

impl NewFeed {
    /// Creates a feed creation request.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            feed: NewFeedBody { key: key.into() },
        }
    }
}

/// Body of a group creation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewGroup {
    /// Group key.
    pub key: String,
}

/// A service notice delivered on the push channel's `errors` topic.
///
/// `code` follows HTTP status semantics so both channels share one mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceNotice {
    /// Status-like code (404, 429, 401, ...).
    pub code: u16,
    /// Human-readable detail.
    pub message: String,
    /// Feed the notice refers to, `group.key`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feed: Option<String>,
}

/// Feed value wrapped for the push channel's `/json` topics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedEnvelope {
    /// Value, absent for a feed that has never been written.
    #[serde(default)]
    pub value: Option<String>,
    /// Service write time.
    #[serde(default)]
    pub created_at: Option<RemoteTimestamp>,
    /// Metadata attached by the publisher.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
}
