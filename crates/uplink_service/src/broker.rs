//! Publish/subscribe broker.
//!
//! Each session has its own outbox. Values written through any channel are
//! fanned out to every session subscribed to the feed's plain or `/json`
//! topic. Rate limits and errors are reported on the session's
//! `{account}/throttle` and `{account}/errors` topics instead of failing the
//! publish.

use crate::error::{ServiceError, ServiceResult};
use crate::handler::HandlerContext;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, trace};
use uplink_protocol::{Credentials, FeedEnvelope, FeedName, ServiceNotice, Topic, TopicFormat};

/// One connected client.
#[derive(Debug)]
pub(crate) struct Session {
    account: String,
    subscriptions: BTreeSet<String>,
    outbox: VecDeque<(String, String)>,
}

impl Session {
    fn new(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            subscriptions: BTreeSet::new(),
            outbox: VecDeque::new(),
        }
    }

    fn deliver(&mut self, topic: impl Into<String>, payload: impl Into<String>) {
        self.outbox.push_back((topic.into(), payload.into()));
    }

    /// Queues a notice for an in-band error.
    fn notify(&mut self, err: &ServiceError, feed: Option<&FeedName>) {
        if let ServiceError::RateLimited { .. } = err {
            let topic = Topic::Throttle {
                account: self.account.clone(),
            };
            self.deliver(topic.to_string(), err.to_string());
            return;
        }
        let notice = ServiceNotice {
            code: err.status(),
            message: err.to_string(),
            feed: feed.map(ToString::to_string),
        };
        let topic = Topic::Errors {
            account: self.account.clone(),
        };
        match serde_json::to_string(&notice) {
            Ok(payload) => self.deliver(topic.to_string(), payload),
            Err(e) => debug!(error = %e, "could not encode notice"),
        }
    }
}

impl HandlerContext {
    /// Delivers the current value of a feed to every subscribed session.
    pub(crate) fn fan_out(&self, name: &FeedName) -> ServiceResult<()> {
        let envelope = self.store.envelope(name)?;
        let value = envelope.value.clone().unwrap_or_default();
        let json = serde_json::to_string(&envelope)
            .map_err(|e| ServiceError::Internal(e.to_string()))?;

        let mut sessions = self.sessions.write();
        for session in sessions.values_mut() {
            let plain = Topic::feed(session.account.clone(), name.clone()).to_string();
            let wrapped = Topic::feed_json(session.account.clone(), name.clone()).to_string();
            if session.subscriptions.contains(&plain) {
                session.deliver(plain, value.clone());
            }
            if session.subscriptions.contains(&wrapped) {
                session.deliver(wrapped, json.clone());
            }
        }
        Ok(())
    }
}

/// Broker front end.
pub struct Broker {
    context: Arc<HandlerContext>,
}

impl Broker {
    /// Creates a broker over shared service state.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }

    /// Opens a session. An existing session with the same id is replaced.
    pub fn connect(&self, client_id: &str, credentials: &Credentials) -> ServiceResult<()> {
        self.context.count(|s| s.broker_exchanges += 1);
        if let Some(fault) = self.context.take_fault() {
            return Err(fault);
        }
        self.context
            .authenticate(&credentials.username, &credentials.key)?;
        self.context
            .sessions
            .write()
            .insert(client_id.to_string(), Session::new(&credentials.username));
        debug!(client_id, "session opened");
        Ok(())
    }

    /// Closes a session.
    pub fn disconnect(&self, client_id: &str) {
        if self.context.sessions.write().remove(client_id).is_some() {
            debug!(client_id, "session closed");
        }
    }

    /// Returns true while the session is open.
    pub fn is_connected(&self, client_id: &str) -> bool {
        self.context.sessions.read().contains_key(client_id)
    }

    /// Number of open sessions.
    pub fn session_count(&self) -> usize {
        self.context.sessions.read().len()
    }

    /// Subscribes a session. Subscribing to a feed topic creates the feed.
    pub fn subscribe(&self, client_id: &str, topic: &str) -> ServiceResult<()> {
        if let Some(fault) = self.exchange(client_id)? {
            return Err(fault);
        }
        let parsed =
            Topic::parse(topic).map_err(|e| ServiceError::InvalidRequest(e.to_string()))?;
        self.check_account(client_id, &parsed)?;

        if let Topic::Feed { name, .. } = &parsed {
            self.context.create_feed(name, true)?;
        }
        let now = self.context.clock.now_secs();
        self.with_session(client_id, |session| {
            session.subscriptions.insert(topic.to_string());
            if parsed == Topic::Time {
                session.deliver(topic, now.to_string());
            }
        })?;
        trace!(client_id, topic, "subscribed");
        Ok(())
    }

    /// Removes a subscription.
    pub fn unsubscribe(&self, client_id: &str, topic: &str) -> ServiceResult<()> {
        if let Some(fault) = self.exchange(client_id)? {
            return Err(fault);
        }
        self.with_session(client_id, |session| {
            session.subscriptions.remove(topic);
        })
    }

    /// Publishes a message.
    ///
    /// Feed topics store a value (creating the feed if needed); `/get` topics
    /// answer with the current value on the `/json` topic. Refusals are
    /// reported as notices.
    pub fn publish(&self, client_id: &str, topic: &str, payload: &str) -> ServiceResult<()> {
        if let Some(fault) = self.exchange(client_id)? {
            return self.with_session(client_id, |session| session.notify(&fault, None));
        }

        let parsed = match Topic::parse(topic) {
            Ok(parsed) => parsed,
            Err(e) => {
                let err = ServiceError::InvalidRequest(e.to_string());
                return self.with_session(client_id, |session| session.notify(&err, None));
            }
        };
        if let Err(err) = self.check_account(client_id, &parsed) {
            return self.with_session(client_id, |session| session.notify(&err, None));
        }

        match parsed {
            Topic::Feed { name, format, .. } => {
                let outcome = decode_value(format, payload).and_then(|(value, metadata)| {
                    self.context
                        .write_value(&name, &value, metadata.as_deref(), true)
                });
                match outcome {
                    Ok(_) => Ok(()),
                    Err(err) if err.is_link_error() => Err(err),
                    Err(err) => {
                        self.with_session(client_id, |session| session.notify(&err, Some(&name)))
                    }
                }
            }
            Topic::FeedGet { account, name } => {
                let answer = self.context.store.envelope(&name).and_then(|envelope| {
                    serde_json::to_string(&envelope)
                        .map_err(|e| ServiceError::Internal(e.to_string()))
                });
                let reply = Topic::feed_json(account, name.clone()).to_string();
                self.with_session(client_id, |session| match answer {
                    Ok(json) => session.deliver(reply, json),
                    Err(err) => session.notify(&err, Some(&name)),
                })
            }
            _ => {
                let err = ServiceError::InvalidRequest(format!("cannot publish to {topic}"));
                self.with_session(client_id, |session| session.notify(&err, None))
            }
        }
    }

    /// Takes every message waiting for a session.
    pub fn poll(&self, client_id: &str) -> ServiceResult<Vec<(String, String)>> {
        let fault = self.exchange(client_id)?;
        self.with_session(client_id, |session| {
            if let Some(fault) = &fault {
                session.notify(fault, None);
            }
            session.outbox.drain(..).collect()
        })
    }

    /// Counts the exchange, checks the session and takes the fault.
    ///
    /// Link faults are returned as errors (a dropped link also closes the
    /// session); in-band faults are handed back to the caller.
    fn exchange(&self, client_id: &str) -> ServiceResult<Option<ServiceError>> {
        self.context.count(|s| s.broker_exchanges += 1);
        if !self.is_connected(client_id) {
            return Err(ServiceError::Disconnected);
        }
        match self.context.take_fault() {
            Some(ServiceError::Disconnected) => {
                self.disconnect(client_id);
                Err(ServiceError::Disconnected)
            }
            Some(fault) if fault.is_link_error() => Err(fault),
            other => Ok(other),
        }
    }

    fn check_account(&self, client_id: &str, topic: &Topic) -> ServiceResult<()> {
        let account = match topic {
            Topic::Feed { account, .. }
            | Topic::FeedGet { account, .. }
            | Topic::Group { account, .. }
            | Topic::Throttle { account }
            | Topic::Errors { account } => account,
            Topic::Time => return Ok(()),
        };
        let allowed = self
            .context
            .sessions
            .read()
            .get(client_id)
            .is_some_and(|session| &session.account == account);
        if allowed {
            Ok(())
        } else {
            Err(ServiceError::Forbidden(format!("topic {topic}")))
        }
    }

    fn with_session<R>(
        &self,
        client_id: &str,
        f: impl FnOnce(&mut Session) -> R,
    ) -> ServiceResult<R> {
        let mut sessions = self.context.sessions.write();
        let session = sessions
            .get_mut(client_id)
            .ok_or(ServiceError::Disconnected)?;
        Ok(f(session))
    }
}

/// Extracts the value and metadata carried by a feed publish.
fn decode_value(
    format: TopicFormat,
    payload: &str,
) -> ServiceResult<(String, Option<String>)> {
    match format {
        TopicFormat::Plain => Ok((payload.to_string(), None)),
        TopicFormat::Json => {
            let envelope: FeedEnvelope = serde_json::from_str(payload)
                .map_err(|e| ServiceError::InvalidRequest(e.to_string()))?;
            let value = envelope
                .value
                .ok_or_else(|| ServiceError::InvalidRequest("envelope without value".into()))?;
            Ok((value, envelope.metadata))
        }
    }
}
