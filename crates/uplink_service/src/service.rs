//! The telemetry service facade.

use crate::broker::Broker;
use crate::config::ServiceConfig;
use crate::error::ServiceResult;
use crate::faults::{Fault, FaultPlan};
use crate::handler::{HandlerContext, RequestHandler, ServiceStats};
use crate::notehub::NoteHub;
use crate::store::{FeedStore, ServiceClock};
use parking_lot::MutexGuard;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use uplink_protocol::{Credentials, FeedName, HttpRequest, HttpResponse, RemoteTimestamp};

/// In-memory telemetry service.
///
/// One service speaks all three channels over shared state: the HTTP
/// polling API, the pub/sub broker and the store-and-forward note hub. A
/// value written on one channel is visible on the others.
///
/// # Example
///
/// ```
/// use uplink_service::{ServiceConfig, TelemetryService};
/// use uplink_protocol::{HttpRequest, TIME_PATH};
///
/// let service = TelemetryService::new(ServiceConfig::default()).unwrap();
/// let response = service.handle_http(&HttpRequest::get(TIME_PATH)).unwrap();
/// assert_eq!(response.status, 200);
/// ```
pub struct TelemetryService {
    handler: RequestHandler,
    broker: Broker,
    hub: NoteHub,
    context: Arc<HandlerContext>,
}

impl TelemetryService {
    /// Creates a service.
    pub fn new(config: ServiceConfig) -> ServiceResult<Self> {
        let context = Arc::new(HandlerContext::new(config)?);
        Ok(Self {
            handler: RequestHandler::new(Arc::clone(&context)),
            broker: Broker::new(Arc::clone(&context)),
            hub: NoteHub::new(Arc::clone(&context)),
            context,
        })
    }

    /// Handles an HTTP request.
    pub fn handle_http(&self, request: &HttpRequest) -> ServiceResult<HttpResponse> {
        self.handler.handle(request)
    }

    /// Opens a broker session.
    pub fn broker_connect(&self, client_id: &str, credentials: &Credentials) -> ServiceResult<()> {
        self.broker.connect(client_id, credentials)
    }

    /// The pub/sub broker.
    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Performs a note hub transaction.
    pub fn note_transaction(&self, request: &Value) -> ServiceResult<Value> {
        self.hub.transaction(request)
    }

    /// The note hub.
    pub fn hub(&self) -> &NoteHub {
        &self.hub
    }

    /// Configuration.
    pub fn config(&self) -> &ServiceConfig {
        &self.context.config
    }

    /// Service time.
    pub fn clock(&self) -> &ServiceClock {
        &self.context.clock
    }

    /// Moves service time forward.
    pub fn advance(&self, by: Duration) {
        self.context.clock.advance(by);
    }

    /// Feed storage.
    pub fn store(&self) -> &FeedStore {
        &self.context.store
    }

    /// Writes a value as the dashboard would: no budget, no faults.
    pub fn dashboard_write(&self, name: &FeedName, value: &str) -> ServiceResult<RemoteTimestamp> {
        self.context.write_unbudgeted(name, value)
    }

    /// Queues a fault for the next exchange.
    pub fn inject(&self, fault: Fault) {
        self.context.faults().inject(fault);
    }

    /// Makes the service (un)reachable.
    pub fn set_online(&self, online: bool) {
        self.context.faults().set_online(online);
    }

    /// Fault plan.
    pub fn faults(&self) -> MutexGuard<'_, FaultPlan> {
        self.context.faults()
    }

    /// Writes left in the current budget window.
    pub fn remaining_writes(&self) -> u32 {
        self.context.remaining_writes()
    }

    /// Counters.
    pub fn stats(&self) -> ServiceStats {
        self.context.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uplink_protocol::{feed_path, FeedDocument, FeedKey, API_KEY_HEADER};

    fn temp() -> FeedName {
        FeedName::new("garden", FeedKey::new("temp").unwrap())
    }

    #[test]
    fn channels_share_state() {
        let service = TelemetryService::new(ServiceConfig::new("alice", "aio_key")).unwrap();
        let creds = Credentials::new("alice", "aio_key");

        service.broker_connect("c1", &creds).unwrap();
        service
            .broker()
            .subscribe("c1", "alice/f/garden.temp/json")
            .unwrap();

        service
            .note_transaction(&json!({
                "req": "note.add",
                "body": { "feed": "garden.temp", "value": "7" },
                "sync": true,
            }))
            .unwrap();

        let request = HttpRequest::get(feed_path("alice", &temp()))
            .with_header(API_KEY_HEADER, "aio_key");
        let doc: FeedDocument = service.handle_http(&request).unwrap().decode().unwrap();
        assert_eq!(doc.last_value.as_deref(), Some("7"));

        let pushed = service.broker().poll("c1").unwrap();
        assert_eq!(pushed.len(), 1);
        assert_eq!(service.stats().writes, 1);
    }

    #[test]
    fn dashboard_writes_skip_budget() {
        let config = ServiceConfig::default().with_write_limit(0, Duration::from_secs(60));
        let service = TelemetryService::new(config).unwrap();
        service.dashboard_write(&temp(), "1").unwrap();
        service.advance(Duration::from_millis(10));
        let second = service.dashboard_write(&temp(), "2").unwrap();
        assert_eq!(second.unix_millis(), 1_700_000_000_010);
        assert_eq!(service.remaining_writes(), 0);
    }

    #[test]
    fn offline_service_refuses_http() {
        let service = TelemetryService::new(ServiceConfig::default()).unwrap();
        service.set_online(false);
        assert!(service
            .handle_http(&HttpRequest::get(uplink_protocol::TIME_PATH))
            .is_err());
        service.set_online(true);
        service.inject(Fault::Status(500));
        assert_eq!(
            service
                .handle_http(&HttpRequest::get(uplink_protocol::TIME_PATH))
                .unwrap()
                .status,
            500
        );
    }
}
