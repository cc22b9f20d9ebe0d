//! Shared service state and the HTTP request handler.

use crate::auth::KeyValidator;
use crate::broker::Session;
use crate::config::ServiceConfig;
use crate::error::{ServiceError, ServiceResult};
use crate::faults::FaultPlan;
use crate::limiter::WriteLimiter;
use crate::store::{FeedStore, ServiceClock};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};
use uplink_protocol::{
    DataPoint, FeedKey, FeedName, HttpMethod, HttpRequest, HttpResponse, NewFeed, NewGroup,
    RemoteTimestamp, API_KEY_HEADER,
};

/// Service counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServiceStats {
    /// HTTP requests received.
    pub http_requests: u64,
    /// Broker exchanges received.
    pub broker_exchanges: u64,
    /// Note hub transactions received.
    pub note_transactions: u64,
    /// Values stored.
    pub writes: u64,
    /// Writes refused by the budget.
    pub rejected_writes: u64,
    /// Feeds created.
    pub feeds_created: u64,
}

/// State shared by every channel of the service.
pub struct HandlerContext {
    /// Service configuration.
    pub config: ServiceConfig,
    /// Service time.
    pub clock: ServiceClock,
    /// Feed storage.
    pub store: FeedStore,
    validator: KeyValidator,
    limiter: Mutex<WriteLimiter>,
    faults: Mutex<FaultPlan>,
    stats: Mutex<ServiceStats>,
    /// Broker sessions (client id -> session).
    pub(crate) sessions: RwLock<HashMap<String, Session>>,
}

impl HandlerContext {
    /// Creates a new handler context.
    pub fn new(config: ServiceConfig) -> ServiceResult<Self> {
        let validator = KeyValidator::new(config.account.clone(), &config.api_key)?;
        Ok(Self {
            clock: ServiceClock::new(config.start_millis),
            store: FeedStore::new(config.max_feeds_per_group),
            limiter: Mutex::new(WriteLimiter::new(config.write_limit, config.write_window)),
            validator,
            faults: Mutex::new(FaultPlan::new()),
            stats: Mutex::new(ServiceStats::default()),
            sessions: RwLock::new(HashMap::new()),
            config,
        })
    }

    /// Checks credentials.
    pub fn authenticate(&self, account: &str, api_key: &str) -> ServiceResult<()> {
        self.validator.validate(account, api_key)
    }

    /// Fault plan.
    pub fn faults(&self) -> MutexGuard<'_, FaultPlan> {
        self.faults.lock()
    }

    /// Takes the fault for the current exchange, if any.
    pub fn take_fault(&self) -> Option<ServiceError> {
        let fault = self.faults.lock().next_fault();
        if let Some(fault) = &fault {
            debug!(fault = %fault, "applying fault");
        }
        fault
    }

    /// Counters.
    pub fn stats(&self) -> ServiceStats {
        *self.stats.lock()
    }

    pub(crate) fn count(&self, update: impl FnOnce(&mut ServiceStats)) {
        update(&mut self.stats.lock());
    }

    /// Creates a feed, counting it when new.
    pub fn create_feed(&self, name: &FeedName, create_group: bool) -> ServiceResult<bool> {
        let created = self.store.create_feed(name, create_group)?;
        if created {
            debug!(feed = %name, "feed created");
            self.count(|s| s.feeds_created += 1);
        }
        Ok(created)
    }

    /// Stores a client write against the write budget.
    ///
    /// With `auto_create` a missing feed (and group) is created first.
    pub fn write_value(
        &self,
        name: &FeedName,
        value: &str,
        metadata: Option<&str>,
        auto_create: bool,
    ) -> ServiceResult<RemoteTimestamp> {
        if value.len() > self.config.max_value_len {
            return Err(ServiceError::InvalidRequest(format!(
                "value of {} bytes exceeds {}",
                value.len(),
                self.config.max_value_len
            )));
        }
        if !auto_create {
            self.store.feed(name)?;
        }
        if let Err(err) = self.limiter.lock().acquire(self.clock.now_millis()) {
            self.count(|s| s.rejected_writes += 1);
            return Err(err);
        }
        if auto_create {
            self.create_feed(name, true)?;
        }
        self.commit(name, value, metadata)
    }

    /// Stores a write that bypasses the budget, as a dashboard would.
    pub fn write_unbudgeted(&self, name: &FeedName, value: &str) -> ServiceResult<RemoteTimestamp> {
        self.create_feed(name, true)?;
        self.commit(name, value, None)
    }

    fn commit(
        &self,
        name: &FeedName,
        value: &str,
        metadata: Option<&str>,
    ) -> ServiceResult<RemoteTimestamp> {
        let stamp = self.store.write(name, value, metadata, self.clock.now()?)?;
        self.count(|s| s.writes += 1);
        trace!(feed = %name, at = %stamp, "value stored");
        self.fan_out(name)?;
        Ok(stamp)
    }

    /// Writes left in the current budget window.
    pub fn remaining_writes(&self) -> u32 {
        self.limiter.lock().remaining(self.clock.now_millis())
    }
}

/// Handler for HTTP requests.
pub struct RequestHandler {
    context: Arc<HandlerContext>,
}

impl RequestHandler {
    /// Creates a new request handler.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }

    /// Handles one request.
    ///
    /// Application errors come back as responses with a status. Only link
    /// errors (dropped connection, timeout) are returned as `Err`.
    pub fn handle(&self, request: &HttpRequest) -> ServiceResult<HttpResponse> {
        self.context.count(|s| s.http_requests += 1);
        let result = match self.context.take_fault() {
            Some(fault) => Err(fault),
            None => self.route(request),
        };
        match result {
            Ok(response) => Ok(response),
            Err(err) if err.is_link_error() => Err(err),
            Err(err) => {
                debug!(path = %request.path, status = err.status(), error = %err, "request refused");
                Ok(HttpResponse::new(err.status(), err.to_string()))
            }
        }
    }

    fn route(&self, request: &HttpRequest) -> ServiceResult<HttpResponse> {
        let segments: Vec<&str> = request.path.trim_start_matches('/').split('/').collect();
        let store = &self.context.store;

        match (request.method, segments.as_slice()) {
            (HttpMethod::Get, ["api", "v2", "time", "seconds"]) => Ok(HttpResponse::new(
                200,
                self.context.clock.now_secs().to_string(),
            )),
            (method, ["api", "v2", account, rest @ ..]) => {
                let key = request
                    .header(API_KEY_HEADER)
                    .ok_or_else(|| ServiceError::Unauthorized("missing API key".into()))?;
                self.context.authenticate(account, key)?;

                match (method, rest) {
                    (HttpMethod::Get, ["groups", group]) => json(200, &store.group(group)?),
                    (HttpMethod::Post, ["groups"]) => {
                        let body: NewGroup = decode(request)?;
                        json(201, &store.create_group(&body.key)?)
                    }
                    (HttpMethod::Post, ["groups", group, "feeds"]) => {
                        let body: NewFeed = decode(request)?;
                        let key = FeedKey::new(body.feed.key)
                            .map_err(|e| ServiceError::InvalidRequest(e.to_string()))?;
                        let name = FeedName::new(*group, key);
                        self.context.create_feed(&name, false)?;
                        json(201, &store.feed(&name)?)
                    }
                    (HttpMethod::Get, ["feeds", name]) => json(200, &store.feed(&parse_name(name)?)?),
                    (HttpMethod::Post, ["feeds", name, "data"]) => {
                        let body: DataPoint = decode(request)?;
                        let name = parse_name(name)?;
                        self.context
                            .write_value(&name, &body.value, body.metadata.as_deref(), false)?;
                        json(200, &store.feed(&name)?)
                    }
                    _ => Err(ServiceError::NotFound(format!("route {}", request.path))),
                }
            }
            _ => Err(ServiceError::NotFound(format!("route {}", request.path))),
        }
    }
}

fn parse_name(name: &str) -> ServiceResult<FeedName> {
    FeedName::parse(name).map_err(|e| ServiceError::InvalidRequest(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(request: &HttpRequest) -> ServiceResult<T> {
    let body = request
        .body
        .as_deref()
        .ok_or_else(|| ServiceError::InvalidRequest("missing body".into()))?;
    serde_json::from_str(body).map_err(|e| ServiceError::InvalidRequest(e.to_string()))
}

fn json<T: Serialize>(status: u16, body: &T) -> ServiceResult<HttpResponse> {
    let body = serde_json::to_string(body).map_err(|e| ServiceError::Internal(e.to_string()))?;
    Ok(HttpResponse::new(status, body))
}
