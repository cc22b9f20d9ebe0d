//! # Uplink Service
//!
//! Reference in-memory telemetry service for the uplink engine.
//!
//! This crate provides:
//! - Feeds and groups with service-controlled time
//! - A sliding-window write budget (30 writes per minute by default)
//! - API key authentication (HMAC-SHA256 digests, constant-time checks)
//! - HTTP routing for the polling channel
//! - A pub/sub broker with per-session outboxes
//! - A store-and-forward note hub
//! - Fault injection: status codes, dropped links, timeouts, memory
//!   exhaustion and full outages
//!
//! # Architecture
//!
//! All channels share one [`HandlerContext`]. A write on any channel is
//! stamped with service time, checked against the budget and fanned out to
//! broker sessions subscribed to the feed.
//!
//! Nothing here does I/O; clients reach the service through in-process
//! loopback adapters (see `uplink_testkit`).

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Production code MUST NOT use panic!/unwrap()/expect()
#![cfg_attr(
    not(test),
    warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)
)]

mod auth;
mod broker;
mod config;
mod error;
mod faults;
mod handler;
mod limiter;
mod notehub;
mod service;
mod store;

pub use auth::KeyValidator;
pub use broker::Broker;
pub use config::ServiceConfig;
pub use error::{ServiceError, ServiceResult};
pub use faults::{Fault, FaultPlan};
pub use handler::{HandlerContext, RequestHandler, ServiceStats};
pub use limiter::WriteLimiter;
pub use notehub::NoteHub;
pub use service::TelemetryService;
pub use store::{FeedStore, ServiceClock};
