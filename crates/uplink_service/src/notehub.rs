//! Store-and-forward modem and its hub.
//!
//! Transactions are JSON objects with a `req` field. Failures are answered
//! in-band with an `err` string ending in a `{tag}`. Notes added to a
//! notefile stay on the modem until a `hub.sync` (or a note added with
//! `"sync": true`) forwards them; forwarded notes count against the write
//! budget like any other write. Notes sent to the device wait in `data.qi`
//! until the device takes them with `note.get`.

use crate::error::{ServiceError, ServiceResult};
use crate::handler::HandlerContext;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};
use uplink_protocol::FeedName;

/// Simulated modem attached to the service.
pub struct NoteHub {
    context: Arc<HandlerContext>,
    queued: Mutex<VecDeque<Value>>,
    inbound: Mutex<VecDeque<Value>>,
}

impl NoteHub {
    /// Creates a modem with an empty note queue.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self {
            context,
            queued: Mutex::new(VecDeque::new()),
            inbound: Mutex::new(VecDeque::new()),
        }
    }

    /// Queues a note for the device in `data.qi`.
    pub fn send_to_device(&self, body: Value) {
        self.inbound.lock().push_back(body);
    }

    /// Notes waiting for the device.
    pub fn inbound(&self) -> usize {
        self.inbound.lock().len()
    }

    /// Notes waiting on the modem.
    pub fn queued(&self) -> usize {
        self.queued.lock().len()
    }

    /// Performs one transaction.
    ///
    /// Only a timeout fails the exchange itself; every other problem is
    /// answered with an `err` field.
    pub fn transaction(&self, request: &Value) -> ServiceResult<Value> {
        self.context.count(|s| s.note_transactions += 1);
        let req = request.get("req").and_then(Value::as_str).unwrap_or("");
        let online = match self.context.take_fault() {
            None => true,
            Some(ServiceError::Disconnected) => false,
            Some(ServiceError::TimedOut) => return Err(ServiceError::TimedOut),
            Some(fault) => return Ok(error_response(&fault)),
        };

        let result = match (req, online) {
            ("card.status", true) => Ok(json!({ "connected": true, "status": "connected {connected}" })),
            ("card.status", false) => Ok(json!({ "status": "searching {network-search}" })),
            ("note.add", _) => self.add_note(request, online),
            (_, false) => Err(ServiceError::Disconnected),
            ("card.time", true) => Ok(json!({ "time": self.context.clock.now_secs() })),
            ("hub.sync", true) => self.sync().map(|()| json!({})),
            ("env.get", true) => self.env_get(request),
            ("env.default", true) => self.env_default(request),
            ("env.modified", true) => Ok(self.env_modified()),
            ("note.get", true) => Ok(self.note_get(request)),
            (other, true) => Err(ServiceError::InvalidRequest(format!("unknown request {other}"))),
        };
        Ok(result.unwrap_or_else(|err| error_response(&err)))
    }

    fn add_note(&self, request: &Value, online: bool) -> ServiceResult<Value> {
        let body = request
            .get("body")
            .cloned()
            .ok_or_else(|| ServiceError::InvalidRequest("note without body".into()))?;
        let total = {
            let mut queued = self.queued.lock();
            queued.push_back(body);
            queued.len()
        };
        let sync = request.get("sync").and_then(Value::as_bool).unwrap_or(false);
        if sync && online {
            self.sync()?;
        }
        Ok(json!({ "total": total }))
    }

    /// Forwards queued notes in order. A rate limit leaves the rest queued.
    fn sync(&self) -> ServiceResult<()> {
        loop {
            let Some(note) = self.queued.lock().pop_front() else {
                return Ok(());
            };
            match self.apply(&note) {
                Ok(()) => {}
                Err(err @ ServiceError::RateLimited { .. }) => {
                    self.queued.lock().push_front(note);
                    debug!(queued = self.queued(), "hub sync paused by rate limit");
                    return Err(err);
                }
                Err(err) => warn!(error = %err, "dropping undeliverable note"),
            }
        }
    }

    fn apply(&self, note: &Value) -> ServiceResult<()> {
        let name = note
            .get("feed")
            .and_then(Value::as_str)
            .ok_or_else(|| ServiceError::InvalidRequest("note without feed".into()))?;
        let name = parse_name(name)?;
        let value = note
            .get("value")
            .and_then(Value::as_str)
            .ok_or_else(|| ServiceError::InvalidRequest("note without value".into()))?;
        let metadata = note.get("metadata").and_then(Value::as_str);
        self.context.write_value(&name, value, metadata, true)?;
        Ok(())
    }

    fn env_get(&self, request: &Value) -> ServiceResult<Value> {
        let name = parse_name(variable(request)?)?;
        let doc = self.context.store.feed(&name)?;
        let mut rsp = json!({ "text": doc.last_value.unwrap_or_default() });
        if let Some(at) = doc.updated_at {
            rsp["time"] = Value::from(at.unix());
        }
        Ok(rsp)
    }

    fn env_modified(&self) -> Value {
        match self.context.store.last_modified() {
            Some(at) => json!({ "time": at.unix() }),
            None => json!({}),
        }
    }

    fn note_get(&self, request: &Value) -> Value {
        let file = request.get("file").and_then(Value::as_str).unwrap_or("");
        if file != "data.qi" {
            return json!({ "err": format!("no notefile {file} {{note-noexist}}") });
        }
        let delete = request.get("delete").and_then(Value::as_bool).unwrap_or(false);
        let mut inbound = self.inbound.lock();
        let note = if delete {
            inbound.pop_front()
        } else {
            inbound.front().cloned()
        };
        match note {
            Some(body) => json!({ "body": body }),
            None => json!({ "err": "no notes available {note-noexist}" }),
        }
    }

    fn env_default(&self, request: &Value) -> ServiceResult<Value> {
        let name = parse_name(variable(request)?)?;
        self.context.create_feed(&name, true)?;
        Ok(json!({}))
    }
}

fn variable(request: &Value) -> ServiceResult<&str> {
    request
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| ServiceError::InvalidRequest("missing name".into()))
}

fn parse_name(name: &str) -> ServiceResult<FeedName> {
    FeedName::parse(name).map_err(|e| ServiceError::InvalidRequest(e.to_string()))
}

fn error_response(err: &ServiceError) -> Value {
    json!({ "err": format!("{err} {{{}}}", err.note_tag()) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::faults::Fault;
    use std::time::Duration;
    use uplink_protocol::FeedKey;

    fn hub(config: ServiceConfig) -> (NoteHub, Arc<HandlerContext>) {
        let context = Arc::new(HandlerContext::new(config).unwrap());
        (NoteHub::new(Arc::clone(&context)), context)
    }

    fn temp() -> FeedName {
        FeedName::new("garden", FeedKey::new("temp").unwrap())
    }

    fn note(value: &str) -> Value {
        json!({ "req": "note.add", "file": "data.qo", "body": { "feed": "garden.temp", "value": value } })
    }

    #[test]
    fn status_and_time() {
        let (hub, context) = hub(ServiceConfig::default());
        let status = hub.transaction(&json!({ "req": "card.status" })).unwrap();
        assert_eq!(status["connected"], true);
        context.clock.advance(Duration::from_secs(5));
        let time = hub.transaction(&json!({ "req": "card.time" })).unwrap();
        assert_eq!(time["time"], 1_700_000_005i64);
    }

    #[test]
    fn notes_wait_for_sync() {
        let (hub, context) = hub(ServiceConfig::default());
        hub.transaction(&note("1")).unwrap();
        hub.transaction(&note("2")).unwrap();
        assert_eq!(hub.queued(), 2);
        assert!(context.store.feed(&temp()).is_err());

        hub.transaction(&json!({ "req": "hub.sync" })).unwrap();
        assert_eq!(hub.queued(), 0);
        let doc = context.store.feed(&temp()).unwrap();
        assert_eq!(doc.last_value.as_deref(), Some("2"));
    }

    #[test]
    fn offline_modem_still_queues() {
        let (hub, context) = hub(ServiceConfig::default());
        context.faults().set_online(false);
        let status = hub.transaction(&json!({ "req": "card.status" })).unwrap();
        assert!(status.get("connected").is_none());
        hub.transaction(&note("1")).unwrap();
        let sync = hub.transaction(&json!({ "req": "hub.sync" })).unwrap();
        assert!(sync["err"].as_str().unwrap().ends_with("{io}"));
        assert_eq!(hub.queued(), 1);
    }

    #[test]
    fn rate_limit_keeps_remaining_notes() {
        let config = ServiceConfig::default().with_write_limit(1, Duration::from_secs(60));
        let (hub, _) = hub(config);
        hub.transaction(&note("1")).unwrap();
        hub.transaction(&note("2")).unwrap();
        let sync = hub.transaction(&json!({ "req": "hub.sync" })).unwrap();
        assert!(sync["err"].as_str().unwrap().ends_with("{rate-limit}"));
        assert_eq!(hub.queued(), 1);
    }

    #[test]
    fn environment_variables() {
        let (hub, context) = hub(ServiceConfig::default());
        let missing = hub
            .transaction(&json!({ "req": "env.get", "name": "garden.temp" }))
            .unwrap();
        assert!(missing["err"].as_str().unwrap().ends_with("{env-noexist}"));

        hub.transaction(&json!({ "req": "env.default", "name": "garden.temp", "text": "" }))
            .unwrap();
        let empty = hub
            .transaction(&json!({ "req": "env.get", "name": "garden.temp" }))
            .unwrap();
        assert_eq!(empty["text"], "");
        assert!(empty.get("time").is_none());

        context.write_unbudgeted(&temp(), "on").unwrap();
        let set = hub
            .transaction(&json!({ "req": "env.get", "name": "garden.temp" }))
            .unwrap();
        assert_eq!(set["text"], "on");
        assert_eq!(set["time"], 1_700_000_000i64);
    }

    #[test]
    fn modification_time_follows_writes() {
        let (hub, context) = hub(ServiceConfig::default());
        let none = hub.transaction(&json!({ "req": "env.modified" })).unwrap();
        assert!(none.get("time").is_none());

        context.write_unbudgeted(&temp(), "on").unwrap();
        context.clock.advance(Duration::from_secs(7));
        let rsp = hub.transaction(&json!({ "req": "env.modified" })).unwrap();
        assert_eq!(rsp["time"], 1_700_000_000i64);
    }

    #[test]
    fn inbound_notes_are_taken_in_order() {
        let (hub, context) = hub(ServiceConfig::default());
        hub.send_to_device(json!({ "pump": "on" }));
        hub.send_to_device(json!({ "pump": "off" }));
        let get = json!({ "req": "note.get", "file": "data.qi", "delete": true });

        let peek = hub
            .transaction(&json!({ "req": "note.get", "file": "data.qi" }))
            .unwrap();
        assert_eq!(peek["body"]["pump"], "on");
        assert_eq!(hub.inbound(), 2);

        assert_eq!(hub.transaction(&get).unwrap()["body"]["pump"], "on");
        assert_eq!(hub.transaction(&get).unwrap()["body"]["pump"], "off");
        let empty = hub.transaction(&get).unwrap();
        assert!(empty["err"].as_str().unwrap().ends_with("{note-noexist}"));

        hub.send_to_device(json!({ "pump": "on" }));
        context.faults().set_online(false);
        let offline = hub.transaction(&get).unwrap();
        assert!(offline["err"].as_str().unwrap().ends_with("{io}"));
        assert_eq!(hub.inbound(), 1);
    }

    #[test]
    fn faults() {
        let (hub, context) = hub(ServiceConfig::default());
        context.faults().inject(Fault::OutOfMemory);
        context.faults().inject(Fault::Timeout);
        let rsp = hub.transaction(&json!({ "req": "card.time" })).unwrap();
        assert!(rsp["err"].as_str().unwrap().ends_with("{heap}"));
        assert_eq!(
            hub.transaction(&json!({ "req": "card.time" })),
            Err(ServiceError::TimedOut)
        );
    }
}
