//! Store-and-forward transport.
//!
//! Talks to a buffering modem through JSON request/response transactions.
//! Outbound values are queued as notes in `data.qo` and forwarded when the
//! modem next syncs with its hub. Inbound values are hub environment
//! variables named `{group}.{key}`; a receive pass reads them only when
//! `env.modified` reports a change. Notes the hub addresses to the device
//! arrive in `data.qi` and are consumed with `note.get`.
//!
//! Failed transactions carry an `err` string ending in a `{tag}` such as
//! `{note-noexist}`; the tag decides the [`TransportError`].

use crate::error::{TransportError, TransportResult};
use crate::transport::{InboundMessage, ReceiveMode, RemoteFeed, Transport};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, trace, warn};
use uplink_protocol::{FeedKey, FeedName, RemoteTimestamp};

/// Outbound notefile.
pub const OUTBOUND_NOTEFILE: &str = "data.qo";

/// Inbound notefile.
pub const INBOUND_NOTEFILE: &str = "data.qi";

const MAX_NOTES_PER_POLL: usize = 8;

/// Modem abstraction: one JSON request in, one JSON response out.
pub trait NoteClient {
    /// Performs a transaction.
    fn transaction(&mut self, request: &Value) -> TransportResult<Value>;
}

/// Store-and-forward transport over a [`NoteClient`].
pub struct StoreForwardTransport<N: NoteClient> {
    client: N,
    group: String,
    sync_on_send: bool,
    connected: bool,
    env_stamp: Option<i64>,
}

impl<N: NoteClient> StoreForwardTransport<N> {
    /// Creates a transport for a feed group.
    pub fn new(client: N, group: impl Into<String>) -> Self {
        Self {
            client,
            group: group.into(),
            sync_on_send: false,
            connected: false,
            env_stamp: None,
        }
    }

    /// Asks the modem to sync immediately after every note.
    pub fn with_sync_on_send(mut self, sync: bool) -> Self {
        self.sync_on_send = sync;
        self
    }

    /// The underlying client.
    pub fn client(&self) -> &N {
        &self.client
    }

    fn variable(&self, key: &FeedKey) -> String {
        FeedName::new(self.group.clone(), key.clone()).to_string()
    }

    fn require_link(&self) -> TransportResult<()> {
        if self.connected {
            Ok(())
        } else {
            Err(TransportError::Connection("modem not connected".into()))
        }
    }

    /// Runs a transaction and turns an `err` field into an error.
    fn request(&mut self, request: Value) -> TransportResult<Value> {
        trace!(req = %request["req"], "note transaction");
        let response = self.client.transaction(&request);
        let result = response.and_then(|rsp| match rsp.get("err").and_then(Value::as_str) {
            Some(err) => Err(map_note_error(err)),
            None => Ok(rsp),
        });
        if let Err(err) = &result {
            debug!(req = %request["req"], error = %err, "note transaction failed");
            if err.is_link_failure() {
                self.connected = false;
            }
        }
        result
    }
}

/// Maps a modem error string to a transport error by its `{tag}`.
pub fn map_note_error(err: &str) -> TransportError {
    let tag = err
        .rfind('{')
        .and_then(|start| {
            err[start + 1..]
                .find('}')
                .map(|end| &err[start + 1..start + 1 + end])
        })
        .unwrap_or("");
    let detail = err.to_string();
    match tag {
        "rate-limit" => TransportError::RateLimited(detail),
        "not-exist" | "env-noexist" | "note-noexist" => TransportError::NotFound(detail),
        "heap" | "mem" => TransportError::ResourceExhausted(detail),
        "timeout" => TransportError::Timeout(std::time::Duration::ZERO),
        "io" | "busy" => TransportError::Connection(detail),
        "auth" => TransportError::Auth(detail),
        _ => TransportError::Protocol(detail),
    }
}

impl<N: NoteClient> Transport for StoreForwardTransport<N> {
    fn name(&self) -> &'static str {
        "store-forward"
    }

    fn receive_mode(&self) -> ReceiveMode {
        ReceiveMode::Poll
    }

    /// Succeeds once the modem reports a hub connection.
    fn connect(&mut self) -> TransportResult<()> {
        self.connected = true;
        self.env_stamp = None;
        let status = match self.request(json!({ "req": "card.status" })) {
            Ok(status) => status,
            Err(err) => {
                self.connected = false;
                return Err(err);
            }
        };
        if status.get("connected").and_then(Value::as_bool) == Some(true) {
            Ok(())
        } else {
            self.connected = false;
            let detail = status
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("no hub connection");
            Err(TransportError::Connection(detail.to_string()))
        }
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn send(&mut self, key: &FeedKey, payload: &str, metadata: Option<&str>) -> TransportResult<()> {
        self.require_link()?;
        let mut body = json!({ "feed": self.variable(key), "value": payload });
        if let Some(metadata) = metadata {
            body["metadata"] = Value::from(metadata);
        }
        self.request(json!({
            "req": "note.add",
            "file": OUTBOUND_NOTEFILE,
            "body": body,
            "sync": self.sync_on_send,
        }))
        .map(|_| ())
    }

    /// A failed read clears the change stamp so the next pass reads again.
    fn fetch(&mut self, key: &FeedKey) -> TransportResult<RemoteFeed> {
        self.require_link()?;
        let name = self.variable(key);
        let rsp = match self.request(json!({ "req": "env.get", "name": name })) {
            Ok(rsp) => rsp,
            Err(err) => {
                self.env_stamp = None;
                return Err(err);
            }
        };
        let value = match rsp.get("text").and_then(Value::as_str) {
            Some(text) => text.to_string(),
            None => return Err(TransportError::NotFound(format!("variable {name}"))),
        };
        let updated_at = match rsp.get("time").and_then(Value::as_i64) {
            Some(secs) => Some(RemoteTimestamp::from_unix(secs)?),
            None => None,
        };
        Ok(RemoteFeed::new(key.clone(), Some(value), updated_at))
    }

    /// Registers an empty default so the variable exists on the modem.
    fn create_feed(&mut self, key: &FeedKey) -> TransportResult<()> {
        self.require_link()?;
        let name = self.variable(key);
        self.request(json!({ "req": "env.default", "name": name, "text": "" }))
            .map(|_| ())
    }

    /// Reads `data.qi`, deleting each note as it is taken.
    fn poll(&mut self, _timeout: Duration) -> TransportResult<Vec<InboundMessage>> {
        self.require_link()?;
        let mut notes = Vec::new();
        while notes.len() < MAX_NOTES_PER_POLL {
            let request = json!({ "req": "note.get", "file": INBOUND_NOTEFILE, "delete": true });
            let rsp = match self.request(request) {
                Ok(rsp) => rsp,
                Err(TransportError::NotFound(_)) => break,
                Err(err) if notes.is_empty() => return Err(err),
                Err(err) => {
                    warn!(error = %err, received = notes.len(), "inbound note read interrupted");
                    break;
                }
            };
            match rsp.get("body") {
                Some(body) => notes.push(InboundMessage::Note(body.to_string())),
                None => break,
            }
        }
        Ok(notes)
    }

    /// Compares `env.modified` with the value seen on the previous call.
    fn remote_changed(&mut self) -> TransportResult<bool> {
        self.require_link()?;
        let rsp = self.request(json!({ "req": "env.modified" }))?;
        let modified = rsp.get("time").and_then(Value::as_i64).unwrap_or(0);
        let changed = self.env_stamp.map_or(true, |seen| modified > seen);
        self.env_stamp = Some(modified);
        Ok(changed)
    }

    fn time_sync(&mut self) -> TransportResult<Option<i64>> {
        self.require_link()?;
        let rsp = self.request(json!({ "req": "card.time" }))?;
        match rsp.get("time") {
            None => Ok(None),
            Some(time) => time
                .as_i64()
                .map(Some)
                .ok_or_else(|| TransportError::Malformed(format!("card.time: {time}"))),
        }
    }

    /// Forces a hub sync so queued notes leave the modem.
    fn flush(&mut self) -> TransportResult<()> {
        self.require_link()?;
        self.request(json!({ "req": "hub.sync" })).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct TestModem {
        requests: Vec<Value>,
        responses: VecDeque<TransportResult<Value>>,
    }

    impl TestModem {
        fn respond(mut self, rsp: Value) -> Self {
            self.responses.push_back(Ok(rsp));
            self
        }
    }

    impl NoteClient for TestModem {
        fn transaction(&mut self, request: &Value) -> TransportResult<Value> {
            self.requests.push(request.clone());
            self.responses.pop_front().unwrap_or_else(|| Ok(json!({})))
        }
    }

    fn connected(modem: TestModem) -> StoreForwardTransport<TestModem> {
        let modem = TestModem {
            responses: std::iter::once(Ok(json!({ "connected": true })))
                .chain(modem.responses)
                .collect(),
            ..modem
        };
        let mut t = StoreForwardTransport::new(modem, "garden");
        t.connect().unwrap();
        t
    }

    fn key(k: &str) -> FeedKey {
        FeedKey::new(k).unwrap()
    }

    #[test]
    fn error_tags() {
        assert!(matches!(
            map_note_error("slow down {rate-limit}"),
            TransportError::RateLimited(_)
        ));
        assert!(matches!(
            map_note_error("no such variable {env-noexist}"),
            TransportError::NotFound(_)
        ));
        assert!(matches!(
            map_note_error("out of memory {heap}"),
            TransportError::ResourceExhausted(_)
        ));
        assert!(matches!(
            map_note_error("i2c failure {io}"),
            TransportError::Connection(_)
        ));
        assert!(matches!(
            map_note_error("request timed out {timeout}"),
            TransportError::Timeout(_)
        ));
        assert!(matches!(
            map_note_error("something odd"),
            TransportError::Protocol(_)
        ));
    }

    #[test]
    fn connect_requires_hub() {
        let modem = TestModem::default().respond(json!({ "status": "searching" }));
        let mut t = StoreForwardTransport::new(modem, "garden");
        let err = t.connect().unwrap_err();
        assert_eq!(err, TransportError::Connection("searching".into()));
        assert!(!t.is_connected());
    }

    #[test]
    fn send_adds_note() {
        let mut t = connected(TestModem::default());
        t.send(&key("temp"), "21.5", Some("52.1,-1.2")).unwrap();
        let req = &t.client().requests[1];
        assert_eq!(req["req"], "note.add");
        assert_eq!(req["file"], OUTBOUND_NOTEFILE);
        assert_eq!(req["body"]["feed"], "garden.temp");
        assert_eq!(req["body"]["value"], "21.5");
        assert_eq!(req["body"]["metadata"], "52.1,-1.2");
    }

    #[test]
    fn fetch_reads_environment() {
        let mut t = connected(
            TestModem::default()
                .respond(json!({ "text": "on", "time": 1_700_000_000 }))
                .respond(json!({}))
                .respond(json!({ "err": "no such variable {env-noexist}" })),
        );
        let feed = t.fetch(&key("pump")).unwrap();
        assert_eq!(feed.value.as_deref(), Some("on"));
        assert_eq!(feed.updated_at.unwrap().unix(), 1_700_000_000);
        assert!(matches!(
            t.fetch(&key("pump")),
            Err(TransportError::NotFound(_))
        ));
        assert!(matches!(
            t.fetch(&key("pump")),
            Err(TransportError::NotFound(_))
        ));
        assert!(t.is_connected());
    }

    #[test]
    fn environment_reads_are_gated_on_modification() {
        let mut t = connected(
            TestModem::default()
                .respond(json!({ "time": 1_700_000_000 }))
                .respond(json!({ "time": 1_700_000_000 }))
                .respond(json!({ "time": 1_700_000_042 }))
                .respond(json!({ "err": "no such variable {env-noexist}" }))
                .respond(json!({ "time": 1_700_000_042 })),
        );
        assert!(t.remote_changed().unwrap());
        assert!(!t.remote_changed().unwrap());
        assert!(t.remote_changed().unwrap());
        assert!(t.fetch(&key("pump")).is_err());
        assert!(t.remote_changed().unwrap());
        assert_eq!(t.client().requests[1]["req"], "env.modified");
    }

    #[test]
    fn poll_consumes_inbound_notes() {
        let mut t = connected(
            TestModem::default()
                .respond(json!({ "body": { "pump": "on" } }))
                .respond(json!({ "body": { "valve": 3 } }))
                .respond(json!({ "err": "no notes available {note-noexist}" })),
        );
        let notes = t.poll(Duration::ZERO).unwrap();
        assert_eq!(
            notes,
            vec![
                InboundMessage::Note(r#"{"pump":"on"}"#.into()),
                InboundMessage::Note(r#"{"valve":3}"#.into()),
            ]
        );
        let req = &t.client().requests[1];
        assert_eq!(req["req"], "note.get");
        assert_eq!(req["file"], INBOUND_NOTEFILE);
        assert_eq!(req["delete"], true);
    }

    #[test]
    fn poll_failure_before_any_note_is_reported() {
        let mut t = connected(TestModem::default().respond(json!({ "err": "bus {io}" })));
        assert!(matches!(
            t.poll(Duration::ZERO),
            Err(TransportError::Connection(_))
        ));
        assert!(!t.is_connected());
    }

    #[test]
    fn io_failure_drops_link() {
        let mut t = connected(TestModem::default().respond(json!({ "err": "bus {io}" })));
        assert!(t.flush().is_err());
        assert!(!t.is_connected());
    }

    #[test]
    fn create_time_and_flush() {
        let mut t = connected(
            TestModem::default()
                .respond(json!({}))
                .respond(json!({ "time": 1_700_000_123 })),
        );
        t.create_feed(&key("pump")).unwrap();
        assert_eq!(t.time_sync().unwrap(), Some(1_700_000_123));
        t.flush().unwrap();
        let reqs: Vec<&str> = t
            .client()
            .requests
            .iter()
            .filter_map(|r| r["req"].as_str())
            .collect();
        assert_eq!(
            reqs,
            ["card.status", "env.default", "card.time", "hub.sync"]
        );
    }
}
