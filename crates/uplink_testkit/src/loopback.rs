//! In-process clients that carry engine transports to a [`TelemetryService`].
//!
//! Service link errors become the transport errors a real network stack
//! would raise: a dropped link is a connection error, a stalled exchange a
//! timeout.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use uplink_engine::{HttpClient, NoteClient, PubSubClient, TransportError, TransportResult};
use uplink_protocol::{Credentials, HttpRequest, HttpResponse};
use uplink_service::{ServiceError, TelemetryService};

/// Maps a service error seen by a client to a transport error.
pub fn to_transport_error(err: ServiceError, timeout: Duration) -> TransportError {
    match err {
        ServiceError::Disconnected => TransportError::Connection("link dropped".into()),
        ServiceError::TimedOut => TransportError::Timeout(timeout),
        ServiceError::OutOfMemory => TransportError::ResourceExhausted(err.to_string()),
        other => TransportError::from_status(other.status(), other.to_string()),
    }
}

/// HTTP client that calls the service directly.
#[derive(Clone)]
pub struct LoopbackHttpClient {
    service: Arc<TelemetryService>,
}

impl LoopbackHttpClient {
    /// Creates a client.
    pub fn new(service: Arc<TelemetryService>) -> Self {
        Self { service }
    }
}

impl HttpClient for LoopbackHttpClient {
    fn execute(&self, request: &HttpRequest, timeout: Duration) -> TransportResult<HttpResponse> {
        self.service
            .handle_http(request)
            .map_err(|e| to_transport_error(e, timeout))
    }
}

/// Broker client that calls the service directly.
pub struct LoopbackPubSubClient {
    service: Arc<TelemetryService>,
    client_id: Option<String>,
}

impl LoopbackPubSubClient {
    /// Creates a client with no session.
    pub fn new(service: Arc<TelemetryService>) -> Self {
        Self {
            service,
            client_id: None,
        }
    }

    fn session(&self) -> TransportResult<&str> {
        self.client_id
            .as_deref()
            .ok_or_else(|| TransportError::Connection("no session".into()))
    }
}

impl PubSubClient for LoopbackPubSubClient {
    fn connect(&mut self, client_id: &str, credentials: &Credentials) -> TransportResult<()> {
        self.service
            .broker_connect(client_id, credentials)
            .map_err(|e| to_transport_error(e, Duration::ZERO))?;
        self.client_id = Some(client_id.to_string());
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(id) = self.client_id.take() {
            self.service.broker().disconnect(&id);
        }
    }

    fn is_connected(&self) -> bool {
        self.client_id
            .as_deref()
            .is_some_and(|id| self.service.broker().is_connected(id))
    }

    fn publish(&mut self, topic: &str, payload: &str) -> TransportResult<()> {
        let id = self.session()?;
        self.service
            .broker()
            .publish(id, topic, payload)
            .map_err(|e| to_transport_error(e, Duration::ZERO))
    }

    fn subscribe(&mut self, topic: &str) -> TransportResult<()> {
        let id = self.session()?;
        self.service
            .broker()
            .subscribe(id, topic)
            .map_err(|e| to_transport_error(e, Duration::ZERO))
    }

    fn unsubscribe(&mut self, topic: &str) -> TransportResult<()> {
        let id = self.session()?;
        self.service
            .broker()
            .unsubscribe(id, topic)
            .map_err(|e| to_transport_error(e, Duration::ZERO))
    }

    fn poll(&mut self, timeout: Duration) -> TransportResult<Vec<(String, String)>> {
        let id = self.session()?;
        self.service
            .broker()
            .poll(id)
            .map_err(|e| to_transport_error(e, timeout))
    }
}

/// Modem client that calls the service's note hub directly.
#[derive(Clone)]
pub struct LoopbackNoteClient {
    service: Arc<TelemetryService>,
}

impl LoopbackNoteClient {
    /// Creates a client.
    pub fn new(service: Arc<TelemetryService>) -> Self {
        Self { service }
    }
}

impl NoteClient for LoopbackNoteClient {
    fn transaction(&mut self, request: &Value) -> TransportResult<Value> {
        self.service
            .note_transaction(request)
            .map_err(|e| to_transport_error(e, Duration::ZERO))
    }
}
