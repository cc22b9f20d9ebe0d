//! Polling HTTP transport.
//!
//! Feeds are REST resources under `/api/v2/{account}/feeds/{group}.{key}`.
//! The actual HTTP client is abstracted via [`HttpClient`] so any library
//! (or an in-process loopback) can carry the requests.

use crate::error::{TransportError, TransportResult};
use crate::transport::{ReceiveMode, RemoteFeed, Transport};
use std::time::Duration;
use tracing::{debug, trace};
use uplink_protocol::{
    feed_data_path, feed_path, group_feeds_path, group_path, groups_path, Credentials, DataPoint,
    FeedDocument, FeedKey, FeedName, HttpRequest, HttpResponse, NewFeed, NewGroup,
    API_KEY_HEADER, TIME_PATH,
};

/// HTTP client abstraction.
///
/// Implementations must give up after `timeout` and report that as
/// [`TransportError::Timeout`]; link failures are
/// [`TransportError::Connection`].
pub trait HttpClient {
    /// Executes one request.
    fn execute(&self, request: &HttpRequest, timeout: Duration) -> TransportResult<HttpResponse>;

    /// Checks if the client is connected/healthy.
    fn is_healthy(&self) -> bool {
        true
    }
}

/// HTTP-based polling transport.
pub struct HttpTransport<C: HttpClient> {
    client: C,
    credentials: Credentials,
    group: String,
    timeout: Duration,
    connected: bool,
    last_error: Option<TransportError>,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a transport for the given account and group.
    pub fn new(client: C, credentials: Credentials, group: impl Into<String>) -> Self {
        Self {
            client,
            credentials,
            group: group.into(),
            timeout: Duration::from_secs(30),
            connected: false,
            last_error: None,
        }
    }

    /// Sets the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the last error.
    pub fn last_error(&self) -> Option<&TransportError> {
        self.last_error.as_ref()
    }

    /// The underlying client.
    pub fn client(&self) -> &C {
        &self.client
    }

    fn account(&self) -> &str {
        &self.credentials.username
    }

    fn feed_name(&self, key: &FeedKey) -> FeedName {
        FeedName::new(self.group.clone(), key.clone())
    }

    fn require_link(&self) -> TransportResult<()> {
        if self.connected {
            Ok(())
        } else {
            Err(TransportError::Connection("not connected".into()))
        }
    }

    /// Sends a request and maps non-2xx statuses to transport errors.
    fn request(&mut self, request: HttpRequest) -> TransportResult<HttpResponse> {
        let request = request.with_header(API_KEY_HEADER, self.credentials.key.clone());
        trace!(path = %request.path, method = ?request.method, "http request");

        let result = self
            .client
            .execute(&request, self.timeout)
            .and_then(|response| {
                if response.is_success() {
                    Ok(response)
                } else {
                    Err(TransportError::from_status(response.status, response.body))
                }
            });

        match result {
            Ok(response) => {
                self.last_error = None;
                Ok(response)
            }
            Err(err) => {
                if err.is_link_failure() {
                    self.connected = false;
                }
                debug!(path = %request.path, error = %err, "http request failed");
                self.last_error = Some(err.clone());
                Err(err)
            }
        }
    }
}

impl<C: HttpClient> Transport for HttpTransport<C> {
    fn name(&self) -> &'static str {
        "http"
    }

    fn receive_mode(&self) -> ReceiveMode {
        ReceiveMode::Poll
    }

    /// Checks the group exists, creating it when the service has none.
    fn connect(&mut self) -> TransportResult<()> {
        if !self.client.is_healthy() {
            return Err(TransportError::Connection("client unhealthy".into()));
        }
        self.connected = true;

        let path = group_path(self.account(), &self.group);
        let result = match self.request(HttpRequest::get(path)) {
            Ok(_) => Ok(()),
            Err(TransportError::NotFound(_)) => {
                let body = NewGroup {
                    key: self.group.clone(),
                };
                let create = HttpRequest::post(groups_path(self.account()), &body)?;
                self.request(create).map(|_| ())
            }
            Err(err) => Err(err),
        };
        if result.is_err() {
            self.connected = false;
        }
        result
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected && self.client.is_healthy()
    }

    fn send(&mut self, key: &FeedKey, payload: &str, metadata: Option<&str>) -> TransportResult<()> {
        self.require_link()?;
        let path = feed_data_path(self.account(), &self.feed_name(key));
        let request = HttpRequest::post(path, &DataPoint::new(payload, metadata))?;
        self.request(request).map(|_| ())
    }

    fn fetch(&mut self, key: &FeedKey) -> TransportResult<RemoteFeed> {
        self.require_link()?;
        let path = feed_path(self.account(), &self.feed_name(key));
        let document: FeedDocument = self.request(HttpRequest::get(path))?.decode()?;
        Ok(RemoteFeed::new(
            key.clone(),
            document.last_value,
            document.updated_at,
        ))
    }

    fn create_feed(&mut self, key: &FeedKey) -> TransportResult<()> {
        self.require_link()?;
        let path = group_feeds_path(self.account(), &self.group);
        let request = HttpRequest::post(path, &NewFeed::new(key.as_str()))?;
        self.request(request).map(|_| ())
    }

    fn time_sync(&mut self) -> TransportResult<Option<i64>> {
        self.require_link()?;
        let response = self.request(HttpRequest::get(TIME_PATH))?;
        let text = response.body.trim();
        text.parse::<i64>()
            .map(Some)
            .map_err(|_| TransportError::Malformed(format!("time: {text}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use uplink_protocol::HttpMethod;

    /// Replays canned responses and records requests.
    struct TestClient {
        responses: RefCell<VecDeque<TransportResult<HttpResponse>>>,
        requests: RefCell<Vec<HttpRequest>>,
        healthy: bool,
    }

    impl TestClient {
        fn new() -> Self {
            Self {
                responses: RefCell::new(VecDeque::new()),
                requests: RefCell::new(Vec::new()),
                healthy: true,
            }
        }

        fn respond(self, status: u16, body: &str) -> Self {
            self.responses
                .borrow_mut()
                .push_back(Ok(HttpResponse::new(status, body)));
            self
        }

        fn fail(self, err: TransportError) -> Self {
            self.responses.borrow_mut().push_back(Err(err));
            self
        }
    }

    impl HttpClient for TestClient {
        fn execute(&self, request: &HttpRequest, _timeout: Duration) -> TransportResult<HttpResponse> {
            self.requests.borrow_mut().push(request.clone());
            self.responses
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Connection("no response set".into())))
        }

        fn is_healthy(&self) -> bool {
            self.healthy
        }
    }

    fn transport(client: TestClient) -> HttpTransport<TestClient> {
        HttpTransport::new(client, Credentials::new("alice", "aio_key"), "garden")
    }

    fn key(k: &str) -> FeedKey {
        FeedKey::new(k).unwrap()
    }

    #[test]
    fn connect_uses_existing_group() {
        let mut t = transport(TestClient::new().respond(200, r#"{"key":"garden"}"#));
        t.connect().unwrap();
        assert!(t.is_connected());
        let requests = t.client().requests.borrow();
        assert_eq!(requests[0].path, "/api/v2/alice/groups/garden");
        assert_eq!(requests[0].header(API_KEY_HEADER), Some("aio_key"));
    }

    #[test]
    fn connect_creates_missing_group() {
        let mut t = transport(
            TestClient::new()
                .respond(404, "not found")
                .respond(201, r#"{"key":"garden"}"#),
        );
        t.connect().unwrap();
        let requests = t.client().requests.borrow();
        assert_eq!(requests[1].method, HttpMethod::Post);
        assert_eq!(requests[1].path, "/api/v2/alice/groups");
    }

    #[test]
    fn connect_rejects_bad_credentials() {
        let mut t = transport(TestClient::new().respond(401, "bad key"));
        assert!(matches!(t.connect(), Err(TransportError::Auth(_))));
        assert!(!t.is_connected());
    }

    #[test]
    fn unhealthy_client_cannot_connect() {
        let mut client = TestClient::new();
        client.healthy = false;
        let mut t = transport(client);
        assert!(matches!(t.connect(), Err(TransportError::Connection(_))));
    }

    #[test]
    fn send_requires_connection() {
        let mut t = transport(TestClient::new());
        assert!(matches!(
            t.send(&key("temp"), "1", None),
            Err(TransportError::Connection(_))
        ));
    }

    #[test]
    fn status_codes_map_to_errors() {
        let mut t = transport(
            TestClient::new()
                .respond(200, "{}")
                .respond(429, "slow down")
                .respond(404, "no feed")
                .respond(503, "unavailable"),
        );
        t.connect().unwrap();
        assert!(matches!(
            t.send(&key("temp"), "1", None),
            Err(TransportError::RateLimited(_))
        ));
        assert!(matches!(
            t.send(&key("temp"), "1", None),
            Err(TransportError::NotFound(_))
        ));
        assert!(t.is_connected());
        assert!(matches!(
            t.send(&key("temp"), "1", None),
            Err(TransportError::Connection(_))
        ));
        assert!(!t.is_connected());
        assert!(t.last_error().is_some());
    }

    #[test]
    fn send_posts_data_point() {
        let mut t = transport(TestClient::new().respond(200, "{}").respond(200, "{}"));
        t.connect().unwrap();
        t.send(&key("temp"), "21.5", Some("52.1,-1.2")).unwrap();
        let requests = t.client().requests.borrow();
        assert_eq!(requests[1].path, "/api/v2/alice/feeds/garden.temp/data");
        let body: DataPoint = serde_json::from_str(requests[1].body.as_deref().unwrap()).unwrap();
        assert_eq!(body, DataPoint::new("21.5", Some("52.1,-1.2")));
    }

    #[test]
    fn fetch_decodes_feed_document() {
        let mut t = transport(
            TestClient::new()
                .respond(200, "{}")
                .respond(
                    200,
                    r#"{"key":"garden.temp","last_value":"21.5","updated_at":"2024-03-01T12:00:05Z"}"#,
                )
                .respond(200, "not json"),
        );
        t.connect().unwrap();
        let feed = t.fetch(&key("temp")).unwrap();
        assert_eq!(feed.value.as_deref(), Some("21.5"));
        assert_eq!(feed.updated_at.unwrap().unix(), 1_709_294_405);
        assert!(matches!(
            t.fetch(&key("temp")),
            Err(TransportError::Malformed(_))
        ));
    }

    #[test]
    fn time_sync_parses_seconds() {
        let mut t = transport(
            TestClient::new()
                .respond(200, "{}")
                .respond(200, "1700000000\n"),
        );
        t.connect().unwrap();
        assert_eq!(t.time_sync().unwrap(), Some(1_700_000_000));
    }

    #[test]
    fn timeouts_drop_the_link() {
        let mut t = transport(
            TestClient::new()
                .respond(200, "{}")
                .fail(TransportError::Timeout(Duration::from_secs(30))),
        );
        t.connect().unwrap();
        assert!(matches!(
            t.fetch(&key("temp")),
            Err(TransportError::Timeout(_))
        ));
        assert!(!t.is_connected());
    }
}
