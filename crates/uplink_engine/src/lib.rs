//! # Uplink Engine
//!
//! Resilient synchronization of named telemetry feeds with a remote service
//! over an unreliable link.
//!
//! This crate provides:
//! - A [`Transport`] abstraction with HTTP polling, pub/sub push and
//!   store-and-forward implementations
//! - Error classification into an [`ErrorKind`] taxonomy and an
//!   [`EscalationPolicy`] mapping each kind to a recovery [`Action`]
//! - A connection supervisor with a circuit breaker and offline cool-down
//! - Rate-limit aware publishing through a [`ThrottleController`]
//! - Change detection on inbound feeds via strictly-newer remote timestamps
//! - An [`Uplink`] host that drives one synchronization step per [`Uplink::sync`]
//! - Forwarding of local warnings to a remote log feed through [`RemoteLog`]
//!
//! ## Architecture
//!
//! Every step runs on the caller's thread:
//! 1. Release the throttle once its cool-down elapses
//! 2. Leave the offline state once its retry delay elapses
//! 3. Connect (replaying subscriptions) if needed
//! 4. Receive updates, then publish the pending snapshot
//! 5. Forward queued log lines to the log feed
//!
//! Time is read from an injected [`Clock`] so every timing rule is testable
//! with a [`ManualClock`].
//!
//! ## Key Invariants
//!
//! - A feed's cached remote timestamp only ever increases
//! - A rate limit stops the current publish batch immediately
//! - Permanent errors abort the current operation and never retry
//! - Unrecoverable conditions surface as a [`ResetRequest`], never a panic

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(
    not(test),
    warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)
)]

mod classify;
mod clock;
mod config;
mod error;
mod feeds;
mod host;
mod http;
mod pubsub;
mod remote_log;
mod store_forward;
mod supervisor;
mod throttle;
mod transport;

pub use classify::{classify, Action, ErrorEvent, ErrorKind, EscalationPolicy};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{OfflineRetry, UplinkConfig};
pub use error::{ResetRequest, SyncError, SyncResult, TransportError, TransportResult};
pub use feeds::{
    FeedRecord, FeedStats, FeedSyncEngine, PublishOutcome, PublishReport, SyncContext,
    UpdatedFeedSet,
};
pub use host::{SyncReport, Uplink, UplinkStats};
pub use http::{HttpClient, HttpTransport};
pub use pubsub::{PubSubClient, PubSubTransport};
pub use remote_log::{RemoteLog, RemoteLogLayer};
pub use store_forward::{
    map_note_error, NoteClient, StoreForwardTransport, INBOUND_NOTEFILE, OUTBOUND_NOTEFILE,
};
pub use supervisor::{
    ConnectOutcome, ConnectionState, ConnectionSupervisor, Escalation, SupervisorStats,
};
pub use throttle::{IntervalTimer, ThrottleController, ThrottleState};
pub use transport::{
    InboundMessage, MockOp, MockTransport, ReceiveMode, RemoteFeed, SentValue, Transport,
};

pub use uplink_protocol as protocol;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
