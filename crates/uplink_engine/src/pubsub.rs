//! Persistent publish/subscribe transport.
//!
//! Feed values travel on hierarchical topics (see [`Topic`]). The service
//! reports rate limits on `{account}/throttle` and other failures on
//! `{account}/errors`; both are surfaced to the engine as
//! [`InboundMessage::Signal`]s. Values that arrive without a service
//! timestamp are passed on unstamped; the engine stamps them from its
//! service-synced wall clock.

use crate::error::{TransportError, TransportResult};
use crate::transport::{InboundMessage, ReceiveMode, RemoteFeed, Transport};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, trace, warn};
use uplink_protocol::{
    Credentials, FeedEnvelope, FeedKey, FeedName, ServiceNotice, Topic, TopicFormat,
};
use uuid::Uuid;

/// Broker client abstraction.
///
/// `poll` must return within `timeout`, yielding `(topic, payload)` pairs in
/// arrival order.
pub trait PubSubClient {
    /// Opens a session.
    fn connect(&mut self, client_id: &str, credentials: &Credentials) -> TransportResult<()>;

    /// Closes the session.
    fn disconnect(&mut self);

    /// Returns true while the session is open.
    fn is_connected(&self) -> bool;

    /// Publishes a payload.
    fn publish(&mut self, topic: &str, payload: &str) -> TransportResult<()>;

    /// Subscribes to a topic.
    fn subscribe(&mut self, topic: &str) -> TransportResult<()>;

    /// Unsubscribes from a topic.
    fn unsubscribe(&mut self, topic: &str) -> TransportResult<()>;

    /// Receives pending messages.
    fn poll(&mut self, timeout: Duration) -> TransportResult<Vec<(String, String)>>;
}

/// Pub/sub transport over a [`PubSubClient`].
pub struct PubSubTransport<C: PubSubClient> {
    client: C,
    credentials: Credentials,
    group: String,
    client_id: String,
    wait: Duration,
    fetch_rounds: u32,
    pending: VecDeque<InboundMessage>,
}

impl<C: PubSubClient> PubSubTransport<C> {
    /// Creates a transport with a fresh session id.
    pub fn new(client: C, credentials: Credentials, group: impl Into<String>) -> Self {
        Self {
            client,
            credentials,
            group: group.into(),
            client_id: format!("uplink-{}", Uuid::new_v4().simple()),
            wait: Duration::from_millis(100),
            fetch_rounds: 3,
            pending: VecDeque::new(),
        }
    }

    /// Sets how long each broker poll may wait.
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    /// Sets how many polls a fetch waits for its answer.
    pub fn with_fetch_rounds(mut self, rounds: u32) -> Self {
        self.fetch_rounds = rounds.max(1);
        self
    }

    /// Session client id.
    pub fn client_id(&self) -> &str {
        &self.client_id
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

    fn json_topic(&self, key: &FeedKey) -> String {
        Topic::feed_json(self.account(), self.feed_name(key)).to_string()
    }

    fn require_link(&self) -> TransportResult<()> {
        if self.client.is_connected() {
            Ok(())
        } else {
            Err(TransportError::Connection("session closed".into()))
        }
    }

    /// Translates one raw broker message. Messages for other groups and
    /// request topics are dropped.
    fn translate(&self, topic: &str, payload: &str) -> Option<InboundMessage> {
        let parsed = match Topic::parse(topic) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(topic, error = %e, "dropping message on unknown topic");
                return None;
            }
        };

        match parsed {
            Topic::Feed { name, format, .. } if name.group == self.group => {
                let feed = match format {
                    TopicFormat::Json => match serde_json::from_str::<FeedEnvelope>(payload) {
                        Ok(envelope) => {
                            RemoteFeed::new(name.key, envelope.value, envelope.created_at)
                        }
                        Err(e) => {
                            return Some(InboundMessage::Signal(TransportError::Malformed(
                                e.to_string(),
                            )))
                        }
                    },
                    TopicFormat::Plain => {
                        RemoteFeed::new(name.key, Some(payload.to_string()), None)
                    }
                };
                Some(InboundMessage::Feed(feed))
            }
            Topic::Throttle { .. } => Some(InboundMessage::Signal(TransportError::RateLimited(
                payload.to_string(),
            ))),
            Topic::Errors { .. } => {
                let err = match serde_json::from_str::<ServiceNotice>(payload) {
                    Ok(notice) => TransportError::from_status(notice.code, notice.message),
                    Err(_) => TransportError::Malformed(format!("error notice: {payload}")),
                };
                Some(InboundMessage::Signal(err))
            }
            Topic::Time => match payload.trim().parse::<i64>() {
                Ok(secs) => Some(InboundMessage::WallClock(secs)),
                Err(_) => {
                    warn!(payload, "unparseable time broadcast");
                    None
                }
            },
            _ => None,
        }
    }

    fn poll_client(&mut self, timeout: Duration) -> TransportResult<Vec<InboundMessage>> {
        let raw = self.client.poll(timeout)?;
        Ok(raw
            .iter()
            .filter_map(|(topic, payload)| self.translate(topic, payload))
            .collect())
    }
}

impl<C: PubSubClient> Transport for PubSubTransport<C> {
    fn name(&self) -> &'static str {
        "pubsub"
    }

    fn receive_mode(&self) -> ReceiveMode {
        ReceiveMode::Push
    }

    /// Opens a session and subscribes to the account's notice topics.
    fn connect(&mut self) -> TransportResult<()> {
        self.client.connect(&self.client_id, &self.credentials)?;
        let account = self.account().to_string();
        let topics = [
            Topic::Throttle {
                account: account.clone(),
            },
            Topic::Errors { account },
            Topic::Time,
        ];
        for topic in topics {
            if let Err(err) = self.client.subscribe(&topic.to_string()) {
                self.client.disconnect();
                return Err(err);
            }
        }
        debug!(client_id = %self.client_id, "session open");
        Ok(())
    }

    fn disconnect(&mut self) {
        self.client.disconnect();
        self.pending.clear();
    }

    fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    /// Plain values go to the feed topic; values with metadata go wrapped in
    /// an envelope to the `/json` topic.
    fn send(&mut self, key: &FeedKey, payload: &str, metadata: Option<&str>) -> TransportResult<()> {
        self.require_link()?;
        let name = self.feed_name(key);
        match metadata {
            None => {
                let topic = Topic::feed(self.account(), name).to_string();
                self.client.publish(&topic, payload)
            }
            Some(metadata) => {
                let envelope = FeedEnvelope {
                    value: Some(payload.to_string()),
                    created_at: None,
                    metadata: Some(metadata.to_string()),
                };
                let topic = Topic::feed_json(self.account(), name).to_string();
                self.client.publish(&topic, &serde_json::to_string(&envelope)?)
            }
        }
    }

    /// Requests the current value on the `/get` topic and waits a bounded
    /// number of polls for the answer. Unrelated messages are kept for the
    /// next [`Transport::poll`].
    fn fetch(&mut self, key: &FeedKey) -> TransportResult<RemoteFeed> {
        self.require_link()?;
        let name = self.feed_name(key);
        let json_topic = self.json_topic(key);
        let errors_topic = Topic::Errors {
            account: self.account().to_string(),
        }
        .to_string();
        self.client.subscribe(&json_topic)?;
        let get = Topic::feed_get(self.account(), name.clone()).to_string();
        self.client.publish(&get, "")?;

        for _ in 0..self.fetch_rounds {
            let raw = self.client.poll(self.wait)?;
            let mut answer = None;
            for (topic, payload) in raw {
                if answer.is_none() && topic == json_topic {
                    answer = Some(
                        serde_json::from_str::<FeedEnvelope>(&payload)
                            .map(|envelope| {
                                RemoteFeed::new(key.clone(), envelope.value, envelope.created_at)
                            })
                            .map_err(TransportError::from),
                    );
                    continue;
                }
                if answer.is_none() && topic == errors_topic {
                    if let Ok(notice) = serde_json::from_str::<ServiceNotice>(&payload) {
                        if notice.feed.as_deref() == Some(name.to_string().as_str()) {
                            answer = Some(Err(TransportError::from_status(
                                notice.code,
                                notice.message,
                            )));
                            continue;
                        }
                    }
                }
                if let Some(msg) = self.translate(&topic, &payload) {
                    self.pending.push_back(msg);
                }
            }
            if let Some(answer) = answer {
                trace!(feed = %name, "fetch answered");
                return answer;
            }
        }

        let waited = self.wait.saturating_mul(self.fetch_rounds);
        Err(TransportError::Timeout(waited))
    }

    /// The broker creates feeds on first subscription.
    fn create_feed(&mut self, key: &FeedKey) -> TransportResult<()> {
        self.require_link()?;
        let topic = self.json_topic(key);
        self.client.subscribe(&topic)
    }

    fn subscribe(&mut self, key: &FeedKey) -> TransportResult<()> {
        self.require_link()?;
        let topic = self.json_topic(key);
        self.client.subscribe(&topic)
    }

    fn unsubscribe(&mut self, key: &FeedKey) -> TransportResult<()> {
        self.require_link()?;
        let topic = self.json_topic(key);
        self.client.unsubscribe(&topic)
    }

    fn poll(&mut self, timeout: Duration) -> TransportResult<Vec<InboundMessage>> {
        self.require_link()?;
        let mut messages: Vec<InboundMessage> = self.pending.drain(..).collect();
        messages.extend(self.poll_client(timeout)?);
        Ok(messages)
    }

    /// Waits one poll for the time broadcast sent on subscription.
    fn time_sync(&mut self) -> TransportResult<Option<i64>> {
        self.require_link()?;
        let polled = self.poll_client(self.wait)?;
        let queued: Vec<InboundMessage> = self.pending.drain(..).chain(polled).collect();
        let mut latest = None;
        for msg in queued {
            match msg {
                InboundMessage::WallClock(secs) => latest = Some(secs),
                other => self.pending.push_back(other),
            }
        }
        Ok(latest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    /// Scripted broker session.
    #[derive(Default)]
    struct TestClient {
        connected: bool,
        subscriptions: BTreeSet<String>,
        published: Vec<(String, String)>,
        inbox: VecDeque<Vec<(String, String)>>,
        refuse: bool,
    }

    impl TestClient {
        fn deliver(&mut self, batch: &[(&str, &str)]) {
            self.inbox.push_back(
                batch
                    .iter()
                    .map(|(t, p)| (t.to_string(), p.to_string()))
                    .collect(),
            );
        }
    }

    impl PubSubClient for TestClient {
        fn connect(&mut self, client_id: &str, credentials: &Credentials) -> TransportResult<()> {
            assert!(client_id.starts_with("uplink-"));
            if self.refuse || credentials.key != "aio_key" {
                return Err(TransportError::Auth("refused".into()));
            }
            self.connected = true;
            Ok(())
        }

        fn disconnect(&mut self) {
            self.connected = false;
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        fn publish(&mut self, topic: &str, payload: &str) -> TransportResult<()> {
            self.published.push((topic.to_string(), payload.to_string()));
            Ok(())
        }

        fn subscribe(&mut self, topic: &str) -> TransportResult<()> {
            self.subscriptions.insert(topic.to_string());
            Ok(())
        }

        fn unsubscribe(&mut self, topic: &str) -> TransportResult<()> {
            self.subscriptions.remove(topic);
            Ok(())
        }

        fn poll(&mut self, _timeout: Duration) -> TransportResult<Vec<(String, String)>> {
            Ok(self.inbox.pop_front().unwrap_or_default())
        }
    }

    fn transport() -> PubSubTransport<TestClient> {
        let mut t = PubSubTransport::new(
            TestClient::default(),
            Credentials::new("alice", "aio_key"),
            "garden",
        );
        t.connect().unwrap();
        t
    }

    fn key(k: &str) -> FeedKey {
        FeedKey::new(k).unwrap()
    }

    #[test]
    fn connect_subscribes_notice_topics() {
        let t = transport();
        let subs = &t.client().subscriptions;
        assert!(subs.contains("alice/throttle"));
        assert!(subs.contains("alice/errors"));
        assert!(subs.contains("time/seconds"));
    }

    #[test]
    fn refused_session() {
        let mut t = PubSubTransport::new(
            TestClient {
                refuse: true,
                ..Default::default()
            },
            Credentials::new("alice", "aio_key"),
            "garden",
        );
        assert!(matches!(t.connect(), Err(TransportError::Auth(_))));
        assert!(!t.is_connected());
    }

    #[test]
    fn client_ids_are_unique() {
        let a = PubSubTransport::new(TestClient::default(), Credentials::new("a", "k"), "g");
        let b = PubSubTransport::new(TestClient::default(), Credentials::new("a", "k"), "g");
        assert_ne!(a.client_id(), b.client_id());
    }

    #[test]
    fn send_picks_topic_by_metadata() {
        let mut t = transport();
        t.send(&key("temp"), "21", None).unwrap();
        t.send(&key("temp"), "22", Some("52.1,-1.2")).unwrap();
        let published = &t.client().published;
        assert_eq!(published[0], ("alice/f/garden.temp".into(), "21".into()));
        assert_eq!(published[1].0, "alice/f/garden.temp/json");
        let envelope: FeedEnvelope = serde_json::from_str(&published[1].1).unwrap();
        assert_eq!(envelope.metadata.as_deref(), Some("52.1,-1.2"));
    }

    #[test]
    fn fetch_waits_for_answer_and_keeps_other_messages() {
        let mut t = transport();
        t.client.deliver(&[("alice/throttle", "too fast")]);
        t.client.deliver(&[(
            "alice/f/garden.temp/json",
            r#"{"value":"21.5","created_at":"2024-03-01T12:00:05Z"}"#,
        )]);

        let feed = t.fetch(&key("temp")).unwrap();
        assert_eq!(feed.value.as_deref(), Some("21.5"));
        assert_eq!(feed.updated_at.unwrap().unix(), 1_709_294_405);
        assert!(t
            .client()
            .published
            .iter()
            .any(|(topic, _)| topic == "alice/f/garden.temp/get"));

        let pending = t.poll(Duration::ZERO).unwrap();
        assert_eq!(
            pending,
            vec![InboundMessage::Signal(TransportError::RateLimited(
                "too fast".into()
            ))]
        );
    }

    #[test]
    fn fetch_of_missing_feed_is_not_found() {
        let mut t = transport();
        t.client.deliver(&[(
            "alice/errors",
            r#"{"code":404,"message":"feed not found","feed":"garden.temp"}"#,
        )]);
        assert!(matches!(
            t.fetch(&key("temp")),
            Err(TransportError::NotFound(_))
        ));
    }

    #[test]
    fn fetch_times_out() {
        let mut t = transport().with_fetch_rounds(2);
        assert!(matches!(
            t.fetch(&key("temp")),
            Err(TransportError::Timeout(_))
        ));
    }

    #[test]
    fn plain_payloads_arrive_unstamped() {
        let mut t = transport();
        t.client.deliver(&[
            ("alice/f/garden.temp", "1"),
            ("alice/f/garden.temp", "2"),
            ("alice/f/other.temp", "ignored"),
            ("time/seconds", "1700000000"),
        ]);
        let messages = t.poll(Duration::ZERO).unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(
            messages[1],
            InboundMessage::Feed(RemoteFeed::new(key("temp"), Some("2".into()), None))
        );
        assert_eq!(messages[2], InboundMessage::WallClock(1_700_000_000));
    }

    #[test]
    fn malformed_answer_keeps_the_rest_of_the_batch() {
        let mut t = transport();
        t.client.deliver(&[
            ("alice/f/garden.temp/json", "{not json"),
            ("alice/throttle", "too fast"),
            ("time/seconds", "1700000000"),
        ]);
        assert!(matches!(
            t.fetch(&key("temp")),
            Err(TransportError::Malformed(_))
        ));
        let pending = t.poll(Duration::ZERO).unwrap();
        assert_eq!(
            pending,
            vec![
                InboundMessage::Signal(TransportError::RateLimited("too fast".into())),
                InboundMessage::WallClock(1_700_000_000),
            ]
        );
    }

    #[test]
    fn error_notices_map_to_signals() {
        let mut t = transport();
        t.client.deliver(&[
            ("alice/errors", r#"{"code":401,"message":"bad key"}"#),
            ("alice/errors", "garbage"),
        ]);
        let messages = t.poll(Duration::ZERO).unwrap();
        assert!(matches!(
            messages[0],
            InboundMessage::Signal(TransportError::Auth(_))
        ));
        assert!(matches!(
            messages[1],
            InboundMessage::Signal(TransportError::Malformed(_))
        ));
    }

    #[test]
    fn time_sync_keeps_other_messages() {
        let mut t = transport();
        t.client.deliver(&[
            ("time/seconds", "1700000000"),
            ("alice/throttle", "slow"),
        ]);
        assert_eq!(t.time_sync().unwrap(), Some(1_700_000_000));
        assert_eq!(t.poll(Duration::ZERO).unwrap().len(), 1);
    }

    #[test]
    fn subscribe_uses_json_topic() {
        let mut t = transport();
        t.subscribe(&key("setpoint")).unwrap();
        assert!(t.client().subscriptions.contains("alice/f/garden.setpoint/json"));
        t.unsubscribe(&key("setpoint")).unwrap();
        assert!(!t.client().subscriptions.contains("alice/f/garden.setpoint/json"));
    }
}
